//! Node.js stream engine for Otter.
//!
//! Implements the Node.js stream model: pull-based [`Readable`] sources
//! with flowing and paused consumption, buffered [`Writable`] sinks with
//! backpressure and corking, [`Duplex`] and [`Transform`] streams, and the
//! composition utilities [`pipeline()`], [`compose()`] and [`finished()`].
//!
//! All callbacks run on an [`EventLoop`]. Deferred work is queued with
//! `next_tick` and executed in FIFO order by [`EventLoop::run_until_idle`]
//! (or while a future is driven with [`EventLoop::block_on`]).
//!
//! # Modules
//!
//! - `readable`, `writable`, `duplex`, `transform` - stream kinds
//! - `end_of_stream`, `pipeline`, `compose` - completion and chaining
//! - `promises` - future-returning `finished` and `pipeline`
//! - `web` - conversion to and from web-style streams
//! - `abort` - external cancellation
//!
//! # Example
//!
//! ```no_run
//! use otter_streams::{Chunk, EventLoop, Readable, Transform, TransformOptions};
//!
//! let event_loop = EventLoop::new();
//! let source = Readable::from_iter(&event_loop, vec!["a", "b"]);
//! let upper = Transform::new(
//!     &event_loop,
//!     TransformOptions::new()
//!         .object_mode(true)
//!         .transform(|_, chunk, _, cb| {
//!             let text = chunk.as_text().unwrap_or_default().to_uppercase();
//!             cb(Ok(Some(Chunk::from(text))))
//!         }),
//! );
//! source.pipe(&upper);
//! event_loop.run_until_idle();
//! assert_eq!(upper.read(None), Some(Chunk::from("A")));
//! ```

pub mod abort;
pub mod buffer_list;
pub mod chunk;
pub mod compose;
pub mod decoder;
mod destroy;
pub mod duplex;
pub mod end_of_stream;
pub mod error;
pub mod event_loop;
pub mod events;
pub mod iter;
pub mod options;
pub mod pipeline;
pub mod promises;
pub mod readable;
mod state;
mod stream;
pub mod transform;
pub mod web;
pub mod writable;

pub use abort::{AbortController, AbortSignal, add_abort_signal};
pub use buffer_list::BufferList;
pub use chunk::{Chunk, Encoding};
pub use compose::compose;
pub use decoder::StringDecoder;
pub use duplex::Duplex;
pub use end_of_stream::{Cleanup, FinishedOptions, finished};
pub use error::{StreamError, StreamResult};
pub use event_loop::EventLoop;
pub use events::{EventEmitter, EventKind, ListenerId, StreamEvent, StreamId};
pub use iter::ReadableIter;
pub use options::{
    Callback, DuplexOptions, ReadableOptions, TransformOptions, WritableOptions,
    default_high_water_mark, set_default_high_water_mark,
};
pub use pipeline::{ChunkStream, PipelineOptions, Stage, pipeline};
pub use readable::{PipeOptions, Readable};
pub use state::{ReadableStatus, StreamStatus, WritableStatus};
pub use stream::{AnyStream, NodeStream, ReadableStream, WritableStream};
pub use transform::Transform;
pub use web::{WebReadableStream, WebReader, WebSink, WebStreamState, WebWritableStream, WebWriter};
pub use writable::Writable;
