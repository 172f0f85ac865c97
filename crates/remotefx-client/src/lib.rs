//! Client engine for remote plugin processing
//!
//! Offloads a plugin chain to a separate host process, possibly on another
//! machine. Three connections run side by side:
//!
//! - **Command**: synchronous control requests (load, reorder, bypass, presets,
//!   parameters, editor input), serialized by one tagged lock
//! - **Audio**: one block in, one block out per real-time callback, buffered
//!   `buffer_depth` blocks deep to absorb network jitter
//! - **Screen**: the plugin editor image, streamed as incremental updates
//!
//! ## Usage
//!
//! ```ignore
//! use remotefx_client::{ClientConfig, Endpoint, Session};
//!
//! let session = Session::new(ClientConfig::default())?;
//! session.set_server(Endpoint::new("studio-box", 55056));
//! session.init(2, 2, 48000.0, 512, false)?;
//!
//! let slot = session.add_plugin("VST3:Reverb", None)?;
//!
//! // In the audio callback
//! let status = session.process(&inputs, &mut outputs, &midi, &mut midi_out, &transport);
//! ```

pub mod error;
pub use error::{ClientError, ErrorKind, Result};

pub mod config;
pub use config::ClientConfig;

mod endpoint;
pub use endpoint::Endpoint;

mod parameter;
pub use parameter::{Parameter, ParameterCategory, ParameterRange, ParameterWire};

mod plugin;
pub use plugin::{PluginChain, PluginSlot, ServerPlugin};

#[doc(hidden)]
pub mod protocol;

pub use protocol::{
    KeyPress, MidiEvent, MidiEventVec, Modifiers, MouseEvent, MouseEventKind, ParameterResult,
    Precision, TransportInfo, WheelDetails,
};

#[doc(hidden)]
pub mod codec;

mod lock;
pub use lock::{LockId, TaggedGuard, TaggedMutex};

mod audio;
pub use audio::{
    AudioAccess, AudioEngine, AudioGuard, AudioStats, AudioStatsSnapshot, AudioStreamer, FailureHook,
    Sample, StreamLayout, StreamStatus,
};

mod screen;
pub use screen::{ScreenCallback, ScreenImage, ScreenSink, ScreenStreamer};

mod command;
pub use command::{CommandChannel, Connection};

mod session;
pub use session::{InitParams, Session, SessionCallback, SessionState};
