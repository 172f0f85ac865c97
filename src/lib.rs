//! # RemoteFX - Remote Plugin Processing
//!
//! Runs a plugin chain in a separate host process, possibly on another
//! machine, and streams audio and editor images to and from it.
//!
//! ## Architecture
//!
//! RemoteFX is an umbrella crate over:
//! - **remotefx-client** - Session engine (command channel, audio streamer,
//!   screen streamer, parameter model, wire codec)
//!
//! ## Quick Start
//!
//! ```ignore
//! use remotefx::prelude::*;
//!
//! let session = SessionBuilder::new(Endpoint::new("studio-box", 55056))
//!     .channels(2, 2)
//!     .sample_rate(48000.0)
//!     .block_size(512)
//!     .connect()?;
//!
//! let slot = session.add_plugin("VST3:Reverb", None)?;
//! session.set_parameter_value(0, 0, 0.5)?;
//!
//! // In the audio callback
//! let status = session.process(&inputs, &mut outputs, &midi, &mut midi_out, &transport);
//! ```

/// Re-export of remotefx-client for direct access
pub use remotefx_client as client;

pub use remotefx_client::{
    // Errors
    ClientError,
    // Configuration
    ClientConfig,
    Endpoint,
    ErrorKind,
    // Session
    InitParams,
    KeyPress,
    LockId,
    MidiEvent,
    MidiEventVec,
    Modifiers,
    MouseEvent,
    MouseEventKind,
    // Parameters
    Parameter,
    ParameterCategory,
    ParameterRange,
    ParameterResult,
    // Plugins
    PluginChain,
    PluginSlot,
    Precision,
    Result,
    Sample,
    ScreenImage,
    ServerPlugin,
    Session,
    SessionState,
    StreamStatus,
    TransportInfo,
    WheelDetails,
};

mod builder;

pub use builder::SessionBuilder;

/// Convenience prelude for common imports
pub mod prelude {
    pub use crate::{Session, SessionBuilder, SessionState};

    pub use crate::{ClientConfig, ClientError, Endpoint, Result};

    // Plugins and parameters
    pub use crate::{Parameter, PluginSlot, ServerPlugin};

    // Real-time path
    pub use crate::{MidiEvent, MidiEventVec, Sample, StreamStatus, TransportInfo};

    // Editor input
    pub use crate::{KeyPress, Modifiers, MouseEvent, MouseEventKind, ScreenImage};
}
