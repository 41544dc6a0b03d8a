//! Room descriptors and the read-only registry built from configuration.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CoreError, Result};

/// Who may book a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Yellow,
    Red,
    Special,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yellow => "yellow",
            Self::Red => "red",
            Self::Special => "special",
        }
    }
}

/// Where a room's calendar lives upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResourceIdentifier {
    /// Exchange resource mailbox address, queried through EWS free/busy.
    Mailbox(String),
    /// Published ICS feed of the resource calendar.
    IcsUrl(Url),
}

impl ResourceIdentifier {
    /// Lookup key used by [`RoomRegistry::by_resource`].
    fn lookup_key(&self) -> String {
        match self {
            Self::Mailbox(address) => address.to_ascii_lowercase(),
            Self::IcsUrl(url) => url.as_str().to_string(),
        }
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mailbox(address) => write!(f, "mailbox:{address}"),
            Self::IcsUrl(url) => write!(f, "ics:{url}"),
        }
    }
}

/// An immutable, validated room descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Room {
    pub id: String,
    pub title: String,
    pub short_name: String,
    pub resource: ResourceIdentifier,
    pub capacity: Option<u32>,
    pub access_level: Option<AccessLevel>,
    pub restrict_daytime: bool,
    /// Room number in the My University booking system.
    pub my_uni_id: Option<u32>,
}

impl Room {
    /// Returns `true` for rooms hidden from "all rooms" listings by default.
    pub fn is_red(&self) -> bool {
        self.access_level == Some(AccessLevel::Red)
    }
}

/// A room entry as written in configuration, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomSpec {
    pub id: Option<String>,
    pub title: Option<String>,
    pub short_name: Option<String>,
    pub mailbox: Option<String>,
    pub ics_url: Option<String>,
    pub capacity: Option<u32>,
    pub access_level: Option<AccessLevel>,
    pub restrict_daytime: bool,
    pub my_uni_id: Option<u32>,
}

impl RoomSpec {
    /// Starts a spec for a mailbox-backed room.
    pub fn mailbox(
        id: impl Into<String>,
        title: impl Into<String>,
        short_name: impl Into<String>,
        mailbox: impl Into<String>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            title: Some(title.into()),
            short_name: Some(short_name.into()),
            mailbox: Some(mailbox.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_access_level(mut self, level: AccessLevel) -> Self {
        self.access_level = Some(level);
        self
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = Some(capacity);
        self
    }

    #[must_use]
    pub fn with_restrict_daytime(mut self, restrict: bool) -> Self {
        self.restrict_daytime = restrict;
        self
    }

    #[must_use]
    pub fn with_my_uni_id(mut self, id: u32) -> Self {
        self.my_uni_id = Some(id);
        self
    }

    fn validate(self, index: usize) -> Result<Room> {
        let id = required(self.id, index, "id")?;
        let title = required(self.title, index, "title")?;
        let short_name = required(self.short_name, index, "short_name")?;

        let mailbox = self.mailbox.filter(|m| !m.trim().is_empty());
        let ics_url = self.ics_url.filter(|u| !u.trim().is_empty());
        let resource = match (mailbox, ics_url) {
            (Some(address), None) => {
                if !address.contains('@') {
                    return Err(CoreError::invalid_resource(
                        id,
                        format!("mailbox `{address}` is not an email address"),
                    ));
                }
                ResourceIdentifier::Mailbox(address.trim().to_string())
            }
            (None, Some(raw)) => {
                let url = Url::parse(raw.trim()).map_err(|e| {
                    CoreError::invalid_resource(&id, format!("invalid ics_url: {e}"))
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(CoreError::invalid_resource(
                        id,
                        format!("unsupported ics_url scheme `{}`", url.scheme()),
                    ));
                }
                ResourceIdentifier::IcsUrl(url)
            }
            (Some(_), Some(_)) => {
                return Err(CoreError::invalid_resource(
                    id,
                    "set either mailbox or ics_url, not both",
                ));
            }
            (None, None) => {
                return Err(CoreError::MissingField {
                    index,
                    field: "mailbox or ics_url",
                });
            }
        };

        Ok(Room {
            id,
            title,
            short_name,
            resource,
            capacity: self.capacity,
            access_level: self.access_level,
            restrict_daytime: self.restrict_daytime,
            my_uni_id: self.my_uni_id,
        })
    }
}

fn required(value: Option<String>, index: usize, field: &'static str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(CoreError::MissingField { index, field }),
    }
}

/// One person allowed into a room, as written under `[access_lists]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl AccessEntry {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }
}

/// The static set of rooms, fixed after [`RoomRegistry::load`].
#[derive(Debug, Clone, Default)]
pub struct RoomRegistry {
    rooms: Vec<Arc<Room>>,
    by_id: HashMap<String, usize>,
    by_resource: HashMap<String, usize>,
    by_my_uni_id: HashMap<u32, usize>,
    /// Lowercased email to the room ids it is listed for.
    access: HashMap<String, HashSet<String>>,
}

impl RoomRegistry {
    /// Validates every entry and builds the registry.
    ///
    /// Fails on the first entry with a missing required field, an unusable
    /// resource, or an id already seen.
    pub fn load(specs: impl IntoIterator<Item = RoomSpec>) -> Result<Self> {
        let mut registry = Self::default();
        for (index, spec) in specs.into_iter().enumerate() {
            let room = spec.validate(index)?;
            let position = registry.rooms.len();
            match registry.by_id.entry(room.id.clone()) {
                Entry::Occupied(_) => return Err(CoreError::DuplicateRoom(room.id)),
                Entry::Vacant(slot) => {
                    slot.insert(position);
                }
            }
            registry
                .by_resource
                .entry(room.resource.lookup_key())
                .or_insert(position);
            if let Some(my_uni_id) = room.my_uni_id {
                registry.by_my_uni_id.entry(my_uni_id).or_insert(position);
            }
            registry.rooms.push(Arc::new(room));
        }
        tracing::debug!(rooms = registry.rooms.len(), "room registry loaded");
        Ok(registry)
    }

    /// Attaches per-room access lists.
    ///
    /// Every key must name a loaded room. Emails match case-insensitively.
    pub fn with_access_lists<I, L>(mut self, lists: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, L)>,
        L: IntoIterator<Item = AccessEntry>,
    {
        for (room_id, entries) in lists {
            if !self.by_id.contains_key(&room_id) {
                return Err(CoreError::UnknownAccessListRoom(room_id));
            }
            for entry in entries {
                let email = entry.email.trim().to_ascii_lowercase();
                if email.is_empty() {
                    continue;
                }
                self.access.entry(email).or_default().insert(room_id.clone());
            }
        }
        tracing::debug!(people = self.access.len(), "access lists loaded");
        Ok(self)
    }

    /// Whether `email` is on the access list of `room_id`.
    pub fn has_access(&self, email: &str, room_id: &str) -> bool {
        self.access
            .get(&email.trim().to_ascii_lowercase())
            .is_some_and(|rooms| rooms.contains(room_id))
    }

    /// Rooms whose access list names `email`, in configuration order.
    pub fn rooms_for(&self, email: &str) -> Vec<Arc<Room>> {
        let Some(ids) = self.access.get(&email.trim().to_ascii_lowercase()) else {
            return Vec::new();
        };
        self.rooms
            .iter()
            .filter(|room| ids.contains(&room.id))
            .cloned()
            .collect()
    }

    /// Rooms a caller sees when asking for "all".
    ///
    /// Red rooms appear with `include_red`, or when `email` is on their
    /// access list.
    pub fn visible(&self, include_red: bool, email: Option<&str>) -> Vec<Arc<Room>> {
        self.rooms
            .iter()
            .filter(|room| {
                include_red
                    || !room.is_red()
                    || email.is_some_and(|email| self.has_access(email, &room.id))
            })
            .cloned()
            .collect()
    }

    /// Looks up a room by id.
    pub fn get(&self, id: &str) -> Option<&Arc<Room>> {
        self.by_id.get(id).map(|&i| &self.rooms[i])
    }

    /// Looks up a room by mailbox address (case-insensitive) or ICS URL.
    pub fn by_resource(&self, resource: &str) -> Option<&Arc<Room>> {
        let key = if resource.contains('@') && !resource.contains("://") {
            resource.to_ascii_lowercase()
        } else {
            resource.to_string()
        };
        self.by_resource.get(&key).map(|&i| &self.rooms[i])
    }

    /// Looks up a room by its My University number.
    pub fn by_my_uni_id(&self, id: u32) -> Option<&Arc<Room>> {
        self.by_my_uni_id.get(&id).map(|&i| &self.rooms[i])
    }

    /// Rooms in configuration order; red-access rooms only with `include_red`.
    pub fn all(&self, include_red: bool) -> Vec<Arc<Room>> {
        self.visible(include_red, None)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
