//! Plejd mesh wire frames
//!
//! Decrypted frames share one layout in both directions:
//!
//! ```text
//! ┌─────────┬──────────────┬──────────┬──────────────────┐
//! │ address │ request kind │  opcode  │ payload          │
//! │  (1B)   │  (2B, BE)    │ (2B, BE) │ (opcode-defined) │
//! └─────────┴──────────────┴──────────┴──────────────────┘
//! ```
//!
//! The address byte is a flat namespace; whether it names an output, an
//! input or a scene depends on the opcode.

use bytes::{BufMut, BytesMut};

use crate::error::{PlejdError, Result};

/// Minimum length of a decrypted inbound frame
pub const MIN_FRAME_LEN: usize = 5;

/// Mesh-wide broadcast address
pub const BROADCAST_ADDRESS: u8 = 0x01;

/// Address scene triggers are sent to
pub const SCENE_TRIGGER_ADDRESS: u8 = 0x02;

const STATE_OFFSET: usize = 5;
const BUTTON_OFFSET: usize = 6;
const DIM_OFFSET: usize = 7;
const TIME_OFFSET: usize = 5;

/// Request kind carried in bytes 1-2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Fire-and-forget (0x0110)
    NoResponse,
    /// The addressed device answers (0x0102)
    ResponseExpected,
    /// Any other value seen on the mesh
    Other(u16),
}

impl From<u16> for RequestKind {
    fn from(value: u16) -> Self {
        match value {
            0x0110 => Self::NoResponse,
            0x0102 => Self::ResponseExpected,
            other => Self::Other(other),
        }
    }
}

impl From<RequestKind> for u16 {
    fn from(kind: RequestKind) -> Self {
        match kind {
            RequestKind::NoResponse => 0x0110,
            RequestKind::ResponseExpected => 0x0102,
            RequestKind::Other(value) => value,
        }
    }
}

/// Frame opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// On/off state (0x0097)
    StateChange,
    /// Dim level report (0x00c8)
    DimChange,
    /// Dim level command/report (0x0098)
    Dim2Change,
    /// Scene triggered (0x0021)
    SceneTrigger,
    /// Mesh clock broadcast or query (0x001b)
    TimeUpdate,
    /// Wireless button press (0x0016)
    RemoteClick,
    /// Color temperature (0x0420)
    ColorChange,
    /// Unrecognised opcode
    Unknown(u16),
}

impl From<u16> for Opcode {
    fn from(value: u16) -> Self {
        match value {
            0x0097 => Self::StateChange,
            0x00c8 => Self::DimChange,
            0x0098 => Self::Dim2Change,
            0x0021 => Self::SceneTrigger,
            0x001b => Self::TimeUpdate,
            0x0016 => Self::RemoteClick,
            0x0420 => Self::ColorChange,
            other => Self::Unknown(other),
        }
    }
}

impl From<Opcode> for u16 {
    fn from(opcode: Opcode) -> Self {
        match opcode {
            Opcode::StateChange => 0x0097,
            Opcode::DimChange => 0x00c8,
            Opcode::Dim2Change => 0x0098,
            Opcode::SceneTrigger => 0x0021,
            Opcode::TimeUpdate => 0x001b,
            Opcode::RemoteClick => 0x0016,
            Opcode::ColorChange => 0x0420,
            Opcode::Unknown(value) => value,
        }
    }
}

/// A decrypted mesh frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshFrame {
    /// Target (outbound) or source (inbound) address
    pub address: u8,
    /// Request kind
    pub request_kind: RequestKind,
    /// Opcode
    pub opcode: Opcode,
    /// Opcode-specific payload
    pub payload: Vec<u8>,
}

impl MeshFrame {
    /// Create a frame
    pub fn new(address: u8, request_kind: RequestKind, opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            address,
            request_kind,
            opcode,
            payload,
        }
    }

    /// Serialize the frame to its wire form (before encryption)
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(MIN_FRAME_LEN + self.payload.len());
        buf.put_u8(self.address);
        buf.put_u16(self.request_kind.into());
        buf.put_u16(self.opcode.into());
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Parse a decrypted frame
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_FRAME_LEN {
            return Err(PlejdError::FrameTooShort {
                len: data.len(),
                min: MIN_FRAME_LEN,
            });
        }

        Ok(Self {
            address: data[0],
            request_kind: RequestKind::from(u16::from_be_bytes([data[1], data[2]])),
            opcode: Opcode::from(u16::from_be_bytes([data[3], data[4]])),
            payload: data[MIN_FRAME_LEN..].to_vec(),
        })
    }

    /// Byte at an absolute frame offset, if present
    fn byte_at(&self, offset: usize) -> Option<u8> {
        offset
            .checked_sub(MIN_FRAME_LEN)
            .and_then(|i| self.payload.get(i).copied())
    }

    // ===== Outbound frame builders =====

    /// Switch an output on (resuming its last dim level) or off
    pub fn state(address: u8, on: bool) -> Self {
        Self::new(
            address,
            RequestKind::NoResponse,
            Opcode::StateChange,
            vec![u8::from(on)],
        )
    }

    /// Set the dim level of an output
    pub fn dim(address: u8, brightness: u8) -> Self {
        Self::new(
            address,
            RequestKind::NoResponse,
            Opcode::Dim2Change,
            vec![0x01, brightness, brightness],
        )
    }

    /// Set the color temperature of an output, in Kelvin
    pub fn color_temperature(address: u8, kelvin: u16) -> Self {
        let [hi, lo] = kelvin.to_be_bytes();
        Self::new(
            address,
            RequestKind::NoResponse,
            Opcode::ColorChange,
            vec![0x03, 0x01, 0x11, hi, lo],
        )
    }

    /// Trigger a stored scene
    pub fn scene(scene_address: u8) -> Self {
        Self::new(
            SCENE_TRIGGER_ADDRESS,
            RequestKind::NoResponse,
            Opcode::SceneTrigger,
            vec![scene_address],
        )
    }

    /// Ask a device for its clock
    pub fn time_query(address: u8) -> Self {
        Self::new(
            address,
            RequestKind::ResponseExpected,
            Opcode::TimeUpdate,
            Vec::new(),
        )
    }

    /// Set a device's clock (seconds, local wall-clock encoded as UTC)
    pub fn time_set(address: u8, local_seconds: u32) -> Self {
        let mut payload = local_seconds.to_le_bytes().to_vec();
        payload.push(0x00);
        Self::new(address, RequestKind::NoResponse, Opcode::TimeUpdate, payload)
    }
}

/// Event decoded from an inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// An output switched on or off
    StateChanged {
        /// Output address
        address: u8,
        /// New state
        on: bool,
    },
    /// An output changed state and dim level
    DimChanged {
        /// Output address
        address: u8,
        /// New state
        on: bool,
        /// New dim level
        brightness: u8,
    },
    /// A scene was triggered
    SceneTriggered {
        /// Scene address
        scene_address: u8,
    },
    /// A wireless button was pressed
    ButtonClicked {
        /// Input address
        input_address: u8,
        /// Button index on the input device
        button: u8,
    },
    /// Mesh clock broadcast
    TimeUpdated {
        /// Reporting address
        address: u8,
        /// Mesh time, seconds of local wall-clock encoded as UTC
        mesh_seconds: i64,
    },
    /// Opcode we do not handle
    Unhandled {
        /// Source address
        address: u8,
        /// Opcode
        opcode: Opcode,
    },
}

impl MeshEvent {
    /// Interpret a decoded frame
    pub fn from_frame(frame: &MeshFrame) -> Self {
        let state = frame.byte_at(STATE_OFFSET).unwrap_or(0);

        match frame.opcode {
            Opcode::StateChange => MeshEvent::StateChanged {
                address: frame.address,
                on: state == 1,
            },
            Opcode::DimChange | Opcode::Dim2Change => MeshEvent::DimChanged {
                address: frame.address,
                on: state == 1,
                brightness: frame.byte_at(DIM_OFFSET).unwrap_or(0),
            },
            Opcode::SceneTrigger => MeshEvent::SceneTriggered {
                scene_address: state,
            },
            // Byte 0 is the node that relayed the click, not the input
            Opcode::RemoteClick => MeshEvent::ButtonClicked {
                input_address: state,
                button: frame.byte_at(BUTTON_OFFSET).unwrap_or(0),
            },
            Opcode::TimeUpdate if frame.payload.len() >= 4 => {
                let mut secs = [0u8; 4];
                for (i, byte) in secs.iter_mut().enumerate() {
                    *byte = frame.byte_at(TIME_OFFSET + i).unwrap_or(0);
                }
                MeshEvent::TimeUpdated {
                    address: frame.address,
                    mesh_seconds: i64::from(u32::from_le_bytes(secs)),
                }
            }
            opcode => MeshEvent::Unhandled {
                address: frame.address,
                opcode,
            },
        }
    }
}
