//! things used to make the mix server: the per listener mix matrix, the
//! clock driven mix callback and the network thread that feeds it.
pub mod channel_state;
pub mod mix_engine;
pub mod mix_server;
pub mod mix_thread;
pub mod net_thread;
pub mod player_list;
