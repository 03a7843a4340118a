pub mod anomaly_detector;
pub mod drawdown_manager;
pub mod execution_service;
pub mod order_strategy_decider;
pub mod orchestrator;
pub mod orphan_sl_log;
pub mod position_restorer;
pub mod position_sizer;
pub mod risk_evaluator;
pub mod tp_sl_manager;
