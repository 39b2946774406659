pub mod congestion;
pub mod defs;
pub mod demux;
pub mod input;
pub mod output;
pub mod packet;
pub mod rate;
pub mod recovery;
pub mod rx_buffer;
pub mod seq;
pub mod timer;
pub mod tx_buffer;
pub mod usrreq;
