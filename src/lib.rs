// BLDS: the biological live data server.
//
// The server owns one live data-acquisition source (a replayed file or a
// hardware array), records its sample stream to disk, and multiplexes it to
// remote clients over a length-prefixed binary protocol. Clients have full
// control of the source and the recording; the server enforces the
// invariants between them.
//
// Module layout:
// - `frame`: sample matrices and the wire data frame
// - `protocol`: message framing, request parsing, reply encoding
// - `datafile`: the on-disk recording container
// - `recorder`: active-recording management
// - `source`: the source trait, back-ends, and the source task
// - `session`: per-client socket tasks
// - `server`: the control task tying everything together
// - `status`: the HTTP status surface
// - `config`: startup configuration

pub mod config;
pub mod datafile;
pub mod frame;
pub mod protocol;
pub mod recorder;
pub mod server;
pub mod session;
pub mod source;
pub mod status;

pub use config::Config;
pub use frame::{DataFrame, SampleMatrix};
pub use server::Server;
