//! Connection layer: the socket channel with its soft/hard write
//! sections, the body-stream adapters, the per-connection processor state
//! machine, and the keep-alive prober.

pub use channel::AjpChannel;
pub use input_buffer::{BodyState, SocketInputBuffer};
pub use keep_alive::spawn_keep_alive;
pub use output_buffer::SocketOutputBuffer;
pub use processor::{Action, ConnectionCancel, Processor, Stage, TxnShared};

mod channel;
mod input_buffer;
mod keep_alive;
mod output_buffer;
mod processor;
