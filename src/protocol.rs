//! Wire message schema shared by the hub, servers and clients.
//!
//! Every envelope is one JSON object per WebSocket text frame, prefixed
//! with a single tag byte that selects the variant. Frames with an
//! unrecognised or missing tag decode to [`NetworkMessage::Unknown`] and
//! are dropped by receivers.

use std::ops::{BitOr, BitOrAssign};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aircraft::{Aircraft, AircraftMetadata, AircraftMotion, AircraftState};
use crate::controllers::{Controller, ControllerMetadata, ControllerState};

/// Bitmask naming which slots of a delta envelope are populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateFields(u8);

impl UpdateFields {
    pub const NONE: UpdateFields = UpdateFields(0);
    pub const DELETE: UpdateFields = UpdateFields(1);
    pub const METADATA: UpdateFields = UpdateFields(1 << 1);
    pub const STATE: UpdateFields = UpdateFields(1 << 2);
    pub const MOVEMENT: UpdateFields = UpdateFields(1 << 3);

    pub fn contains(self, other: UpdateFields) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for UpdateFields {
    type Output = UpdateFields;

    fn bitor(self, rhs: UpdateFields) -> UpdateFields {
        UpdateFields(self.0 | rhs.0)
    }
}

impl BitOrAssign for UpdateFields {
    fn bitor_assign(&mut self, rhs: UpdateFields) {
        self.0 |= rhs.0;
    }
}

/// Sparse change to one aircraft. Tag `%`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AircraftUpdate {
    pub aircraft: Uuid,
    pub update: UpdateFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AircraftMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<AircraftState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion: Option<AircraftMotion>,
}

impl AircraftUpdate {
    pub fn delete(aircraft: Uuid) -> AircraftUpdate {
        AircraftUpdate {
            aircraft,
            update: UpdateFields::DELETE,
            time: None,
            metadata: None,
            state: None,
            motion: None,
        }
    }

    /// Delta carrying the complete entity, as used for creation and for
    /// authoritative snapshots.
    pub fn full(aircraft: Uuid, entity: &Aircraft) -> AircraftUpdate {
        AircraftUpdate {
            aircraft,
            update: UpdateFields::METADATA | UpdateFields::STATE | UpdateFields::MOVEMENT,
            time: Some(entity.time),
            metadata: Some(entity.metadata.clone()),
            state: Some(entity.state),
            motion: Some(entity.motion),
        }
    }

    pub fn is_delete(&self) -> bool {
        self.update.contains(UpdateFields::DELETE)
    }

    /// True when the delta carries every slot needed to build an entity.
    pub fn is_complete(&self) -> bool {
        self.time.is_some() && self.metadata.is_some() && self.state.is_some() && self.motion.is_some()
    }

    /// Merge `rhs` over `self`, keeping `self`'s identifier.
    ///
    /// A delete on the right wipes everything accumulated so far; a delete
    /// already on the left stays set while the right's slots land on top
    /// (remove-then-recreate). Associative.
    pub fn merge(mut self, rhs: AircraftUpdate) -> AircraftUpdate {
        if rhs.is_delete() {
            return AircraftUpdate {
                aircraft: self.aircraft,
                ..rhs
            };
        }
        if rhs.update.contains(UpdateFields::METADATA) {
            self.metadata = rhs.metadata;
        }
        if rhs.update.contains(UpdateFields::STATE) {
            self.time = rhs.time;
            self.state = rhs.state;
        }
        if rhs.update.contains(UpdateFields::MOVEMENT) {
            self.motion = rhs.motion;
        }
        self.update |= rhs.update;
        self
    }

    /// Apply the delta's present slots to an existing entity.
    ///
    /// Deleting through this path is a programmer error: deletion is a
    /// store transition, not an entity mutation.
    pub fn apply_to(&self, entity: &Aircraft) -> anyhow::Result<Aircraft> {
        if self.is_delete() {
            anyhow::bail!("delete delta applied to live aircraft {}", self.aircraft);
        }
        let mut next = entity.clone();
        if self.update.contains(UpdateFields::METADATA)
            && let Some(metadata) = &self.metadata
        {
            next.metadata = metadata.clone();
        }
        if self.update.contains(UpdateFields::STATE) {
            if let Some(time) = self.time {
                next.time = time;
            }
            if let Some(state) = self.state {
                next.state = state;
            }
        }
        if self.update.contains(UpdateFields::MOVEMENT)
            && let Some(motion) = self.motion
        {
            next.motion = motion;
        }
        Ok(next)
    }

    /// Delta containing exactly the fields in which `to` differs from `from`.
    pub fn diff(aircraft: Uuid, from: &Aircraft, to: &Aircraft) -> AircraftUpdate {
        let mut delta = AircraftUpdate {
            aircraft,
            update: UpdateFields::NONE,
            time: None,
            metadata: None,
            state: None,
            motion: None,
        };
        if from.metadata != to.metadata {
            delta.update |= UpdateFields::METADATA;
            delta.metadata = Some(to.metadata.clone());
        }
        if from.time != to.time || from.state != to.state {
            delta.update |= UpdateFields::STATE;
            delta.time = Some(to.time);
            delta.state = Some(to.state);
        }
        if from.motion != to.motion {
            delta.update |= UpdateFields::MOVEMENT;
            delta.motion = Some(to.motion);
        }
        delta
    }
}

/// Sparse change to one controller. Tag `@`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerUpdate {
    pub controller: Uuid,
    pub update: UpdateFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ControllerMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ControllerState>,
}

impl ControllerUpdate {
    pub fn delete(controller: Uuid) -> ControllerUpdate {
        ControllerUpdate {
            controller,
            update: UpdateFields::DELETE,
            time: None,
            metadata: None,
            state: None,
        }
    }

    pub fn full(controller: Uuid, entity: &Controller) -> ControllerUpdate {
        ControllerUpdate {
            controller,
            update: UpdateFields::METADATA | UpdateFields::STATE,
            time: Some(entity.time),
            metadata: Some(entity.metadata.clone()),
            state: Some(entity.state.clone()),
        }
    }

    pub fn is_delete(&self) -> bool {
        self.update.contains(UpdateFields::DELETE)
    }

    pub fn is_complete(&self) -> bool {
        self.time.is_some() && self.metadata.is_some() && self.state.is_some()
    }

    pub fn merge(mut self, rhs: ControllerUpdate) -> ControllerUpdate {
        if rhs.is_delete() {
            return ControllerUpdate {
                controller: self.controller,
                ..rhs
            };
        }
        if rhs.update.contains(UpdateFields::METADATA) {
            self.metadata = rhs.metadata;
        }
        if rhs.update.contains(UpdateFields::STATE) {
            self.time = rhs.time;
            self.state = rhs.state;
        }
        self.update |= rhs.update;
        self
    }

    pub fn apply_to(&self, entity: &Controller) -> anyhow::Result<Controller> {
        if self.is_delete() {
            anyhow::bail!("delete delta applied to live controller {}", self.controller);
        }
        let mut next = entity.clone();
        if self.update.contains(UpdateFields::METADATA)
            && let Some(metadata) = &self.metadata
        {
            next.metadata = metadata.clone();
        }
        if self.update.contains(UpdateFields::STATE) {
            if let Some(time) = self.time {
                next.time = time;
            }
            if let Some(state) = &self.state {
                next.state = state.clone();
            }
        }
        Ok(next)
    }

    pub fn diff(controller: Uuid, from: &Controller, to: &Controller) -> ControllerUpdate {
        let mut delta = ControllerUpdate {
            controller,
            update: UpdateFields::NONE,
            time: None,
            metadata: None,
            state: None,
        };
        if from.metadata != to.metadata {
            delta.update |= UpdateFields::METADATA;
            delta.metadata = Some(to.metadata.clone());
        }
        if from.time != to.time || from.state != to.state {
            delta.update |= UpdateFields::STATE;
            delta.time = Some(to.time);
            delta.state = Some(to.state.clone());
        }
        delta
    }
}

/// Complete-state snapshot pushed to one controller for resync. Tag `*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthoritativeUpdate {
    pub recipient: Uuid,
    pub controllers: Vec<ControllerUpdate>,
    pub aircraft: Vec<AircraftUpdate>,
}

/// Directed chat. Tag `$`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextMessage {
    pub from: Uuid,
    pub to: Uuid,
    pub message: String,
}

/// Chat on a voice frequency. Tag `#`.
///
/// The recipient identifier is derived from the frequency, never carried
/// on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub from: Uuid,
    pub frequency: Decimal,
    pub message: String,
}

impl ChannelMessage {
    /// Recipient identifier for this frequency:
    /// `{frequency·1000 as 8 digits}-0000-0000-0000-000000000000`.
    ///
    /// Decimal arithmetic keeps fractional kHz exact; `134.565` maps to
    /// `13456500-0000-0000-0000-000000000000`.
    pub fn to(&self) -> Uuid {
        channel_recipient(self.frequency)
    }
}

/// See [`ChannelMessage::to`].
pub fn channel_recipient(frequency: Decimal) -> Uuid {
    let scaled = (frequency * Decimal::from(100_000u32)).trunc();
    let digits = scaled.to_u64().unwrap_or(0) % 100_000_000;
    // Decimal digits are a subset of hex, so this always parses
    Uuid::parse_str(&format!("{digits:08}-0000-0000-0000-000000000000")).unwrap()
}

/// Requests removal of one aircraft. Tag `!`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillMessage {
    pub victim: Uuid,
}

/// Closed sum of every envelope the network understands.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkMessage {
    AircraftUpdate(AircraftUpdate),
    ControllerUpdate(ControllerUpdate),
    Authoritative(AuthoritativeUpdate),
    Text(TextMessage),
    Channel(ChannelMessage),
    Kill(KillMessage),
    /// Anything with a missing or unrecognised tag; accepted and dropped.
    Unknown,
}

impl NetworkMessage {
    pub fn tag(&self) -> Option<char> {
        match self {
            NetworkMessage::AircraftUpdate(_) => Some('%'),
            NetworkMessage::ControllerUpdate(_) => Some('@'),
            NetworkMessage::Authoritative(_) => Some('*'),
            NetworkMessage::Text(_) => Some('$'),
            NetworkMessage::Channel(_) => Some('#'),
            NetworkMessage::Kill(_) => Some('!'),
            NetworkMessage::Unknown => None,
        }
    }

    /// One tagged JSON line, ready to be a WebSocket text frame.
    pub fn encode(&self) -> String {
        fn line<T: Serialize>(tag: char, body: &T) -> String {
            // Serialisation of these types cannot fail
            format!("{tag}{}", serde_json::to_string(body).unwrap())
        }
        match self {
            NetworkMessage::AircraftUpdate(m) => line('%', m),
            NetworkMessage::ControllerUpdate(m) => line('@', m),
            NetworkMessage::Authoritative(m) => line('*', m),
            NetworkMessage::Text(m) => line('$', m),
            NetworkMessage::Channel(m) => line('#', m),
            NetworkMessage::Kill(m) => line('!', m),
            NetworkMessage::Unknown => String::new(),
        }
    }

    /// Decode one frame. Unknown tags and malformed bodies fall back to
    /// [`NetworkMessage::Unknown`] instead of erroring; the caller drops
    /// those.
    pub fn decode(frame: &str) -> NetworkMessage {
        let mut chars = frame.chars();
        let Some(tag) = chars.next() else {
            return NetworkMessage::Unknown;
        };
        let body = chars.as_str();

        fn parse<T: for<'de> Deserialize<'de>>(
            body: &str,
            wrap: fn(T) -> NetworkMessage,
        ) -> NetworkMessage {
            serde_json::from_str(body).map_or(NetworkMessage::Unknown, wrap)
        }

        match tag {
            '%' => parse(body, NetworkMessage::AircraftUpdate),
            '@' => parse(body, NetworkMessage::ControllerUpdate),
            '*' => parse(body, NetworkMessage::Authoritative),
            '$' => parse(body, NetworkMessage::Text),
            '#' => parse(body, NetworkMessage::Channel),
            '!' => parse(body, NetworkMessage::Kill),
            _ => NetworkMessage::Unknown,
        }
    }
}
