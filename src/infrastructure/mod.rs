pub mod bitbank_client;
pub mod mock_exchange;
pub mod passive_signals;
pub mod persistence;
