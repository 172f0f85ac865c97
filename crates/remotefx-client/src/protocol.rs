//! Wire protocol between the client and the remote processing host.
//!
//! Three connections are opened to the same endpoint. Each starts with a JSON
//! [`Hello`] frame naming its channel:
//!
//! - command: JSON [`RequestEnvelope`] / [`ResponseEnvelope`] pairs, one at a time
//! - audio: binary frames, bincode [`AudioFrameHeader`] followed by raw samples
//! - screen: binary frames, bincode [`ScreenFrameHeader`] followed by RGBA pixels
//!
//! Every frame is `[u32 length (big-endian)][payload]`, see [`crate::codec`].

use crate::parameter::ParameterWire;
use crate::plugin::ServerPlugin;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub const PROTOCOL_VERSION: u32 = 1;

/// MIDI events carried per audio frame; extra events are dropped.
pub const MAX_MIDI_EVENTS: usize = 256;

/// Raw MIDI event (up to three bytes) with its sample offset inside the block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub frame_offset: u32,
    pub data: [u8; 3],
    pub len: u8,
}

impl MidiEvent {
    pub fn from_bytes(frame_offset: u32, bytes: &[u8]) -> Self {
        let mut data = [0u8; 3];
        let len = bytes.len().min(3);
        data[..len].copy_from_slice(&bytes[..len]);
        Self {
            frame_offset,
            data,
            len: len as u8,
        }
    }

    pub fn note_on(frame_offset: u32, channel: u8, note: u8, velocity: u8) -> Self {
        Self::from_bytes(frame_offset, &[0x90 | (channel & 0x0f), note, velocity])
    }

    pub fn note_off(frame_offset: u32, channel: u8, note: u8) -> Self {
        Self::from_bytes(frame_offset, &[0x80 | (channel & 0x0f), note, 0])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

pub type MidiEventVec = SmallVec<[MidiEvent; MAX_MIDI_EVENTS]>;

/// Negotiated sample precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    #[default]
    Single,
    Double,
}

impl Precision {
    pub fn from_double(double_precision: bool) -> Self {
        if double_precision {
            Precision::Double
        } else {
            Precision::Single
        }
    }

    pub fn sample_size(self) -> usize {
        match self {
            Precision::Single => std::mem::size_of::<f32>(),
            Precision::Double => std::mem::size_of::<f64>(),
        }
    }
}

/// Host transport snapshot, sent with every audio frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransportInfo {
    pub playing: bool,
    pub recording: bool,
    pub looping: bool,
    pub tempo: f64,
    pub time_sig_numerator: i32,
    pub time_sig_denominator: i32,
    pub position_samples: i64,
    pub position_seconds: f64,
    pub position_quarters: f64,
    pub bar_position_quarters: f64,
    pub loop_start_quarters: f64,
    pub loop_end_quarters: f64,
}

impl Default for TransportInfo {
    fn default() -> Self {
        Self {
            playing: false,
            recording: false,
            looping: false,
            tempo: 120.0,
            time_sig_numerator: 4,
            time_sig_denominator: 4,
            position_samples: 0,
            position_seconds: 0.0,
            position_quarters: 0.0,
            bar_position_quarters: 0.0,
            loop_start_quarters: 0.0,
            loop_end_quarters: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Command,
    Audio,
    Screen,
}

/// First frame on every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub channel: ChannelKind,
    pub version: u32,
    /// Zero on the command channel; the server-assigned session otherwise.
    pub session: u64,
    pub client_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<Precision>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HelloReply {
    Welcome {
        session: u64,
        #[serde(default)]
        server_id: u32,
    },
    Refused {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MouseEventKind {
    Move,
    Enter,
    Down,
    Drag,
    Up,
    DoubleClick,
    Wheel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    #[serde(default)]
    pub shift: bool,
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub command: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WheelDetails {
    pub delta_x: f32,
    pub delta_y: f32,
    #[serde(default)]
    pub is_reversed: bool,
    #[serde(default)]
    pub is_smooth: bool,
    #[serde(default)]
    pub is_inertial: bool,
}

/// Mouse event in remote screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MouseEvent {
    pub kind: MouseEventKind,
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub modifiers: Modifiers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wheel: Option<WheelDetails>,
}

impl MouseEvent {
    pub fn new(kind: MouseEventKind, x: f32, y: f32) -> Self {
        Self {
            kind,
            x,
            y,
            modifiers: Modifiers::default(),
            wheel: None,
        }
    }

    pub fn modifiers(mut self, modifiers: Modifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    pub fn wheel(mut self, wheel: WheelDetails) -> Self {
        self.kind = MouseEventKind::Wheel;
        self.wheel = Some(wheel);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPress {
    pub key_code: i32,
    #[serde(default)]
    pub modifiers: Modifiers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<char>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterResult {
    pub idx: i32,
    pub value: f32,
}

/// Client to server command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Init {
        channels_in: u32,
        channels_out: u32,
        sample_rate: f64,
        block_size: u32,
        double_precision: bool,
    },
    AddPlugin {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settings: Option<String>,
    },
    DelPlugin {
        idx: usize,
    },
    EditPlugin {
        idx: usize,
    },
    HidePlugin,
    GetPluginSettings {
        idx: usize,
    },
    SetPluginSettings {
        idx: usize,
        settings: String,
    },
    BypassPlugin {
        idx: usize,
    },
    UnbypassPlugin {
        idx: usize,
    },
    ExchangePlugins {
        idx_a: usize,
        idx_b: usize,
    },
    RecentsList {
        max: usize,
    },
    Preset {
        idx: usize,
        preset: i32,
    },
    GetParameterValue {
        idx: usize,
        param_idx: i32,
    },
    SetParameterValue {
        idx: usize,
        param_idx: i32,
        value: f32,
    },
    GetAllParameterValues {
        idx: usize,
        count: usize,
    },
    Mouse {
        event: MouseEvent,
    },
    Key {
        press: KeyPress,
    },
    ScreenCaptureArea {
        area: i32,
    },
    Rescan {
        wipe: bool,
    },
    CpuLoad,
    Quit,
}

/// Server to client reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Accepted {
        #[serde(default)]
        latency_samples: u32,
    },
    Rejected {
        reason: String,
    },
    PluginAdded {
        #[serde(default)]
        name: String,
        #[serde(default)]
        presets: Vec<String>,
        #[serde(default)]
        parameters: Vec<ParameterWire>,
        #[serde(default)]
        latency_samples: u32,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latency_samples: Option<u32>,
    },
    Settings {
        settings: String,
    },
    Recents {
        plugins: Vec<ServerPlugin>,
    },
    ParameterValue {
        value: f32,
    },
    ParameterValues {
        values: Vec<ParameterResult>,
    },
    Load {
        load: f32,
    },
    Error {
        message: String,
    },
}

impl Response {
    pub fn done() -> Self {
        Response::Done {
            latency_samples: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub seq: u64,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub seq: u64,
    #[serde(flatten)]
    pub response: Response,
}

/// Binary header preceding the samples of one audio frame.
///
/// Samples follow planar: `channels` runs of `samples` values, little endian.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioFrameHeader {
    pub seq: u64,
    pub precision: Precision,
    pub channels: u16,
    pub samples: u32,
    pub midi: MidiEventVec,
    pub transport: TransportInfo,
}

impl AudioFrameHeader {
    pub fn payload_len(&self) -> usize {
        self.channels as usize * self.samples as usize * self.precision.sample_size()
    }
}

/// Binary header preceding one screen update.
///
/// `width`/`height` is the full image; the RGBA pixels that follow cover the
/// dirty rectangle `x, y, w, h` only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenFrameHeader {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl ScreenFrameHeader {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            x: 0,
            y: 0,
            w: width,
            h: height,
        }
    }

    pub fn payload_len(&self) -> usize {
        self.w as usize * self.h as usize * 4
    }

    /// Size of the full RGBA image, `None` if it overflows.
    pub fn image_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(4)
    }

    pub fn fits(&self) -> bool {
        self.x.checked_add(self.w).is_some_and(|r| r <= self.width)
            && self.y.checked_add(self.h).is_some_and(|b| b <= self.height)
    }
}
