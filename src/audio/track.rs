use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::node::protocol::{TrackData, TrackInfo, UpdatePlayerTrack};

/// Datos opacos del llamador que viajan con cada track (p. ej. quién lo pidió).
///
/// El runtime nunca los interpreta: solo los clona y los serializa en los
/// snapshots.
pub trait UserData: Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> UserData for T where T: Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Track resuelto por el nodo más los datos del llamador
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "U: Deserialize<'de>"))]
pub struct Track<U> {
    pub encoded: String,
    pub info: TrackInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<U>,
}

impl<U> Track<U> {
    pub fn title(&self) -> &str {
        &self.info.title
    }

    /// Duración del track; `None` para streams
    pub fn duration(&self) -> Option<Duration> {
        (!self.info.is_stream).then(|| Duration::from_millis(self.info.length))
    }
}

impl<U: UserData> Track<U> {
    pub fn new(data: TrackData, user_data: U) -> Self {
        Self {
            encoded: data.encoded,
            info: data.info,
            user_data: Some(user_data),
        }
    }

    /// Construye desde un track del nodo, recuperando `userData` si el nodo lo
    /// devolvió con la forma esperada.
    pub fn from_data(data: TrackData) -> Self {
        let user_data = if data.user_data.is_null() {
            None
        } else {
            serde_json::from_value(data.user_data).ok()
        };
        Self {
            encoded: data.encoded,
            info: data.info,
            user_data,
        }
    }

    pub(crate) fn to_update(&self) -> UpdatePlayerTrack {
        UpdatePlayerTrack {
            encoded: Some(Some(self.encoded.clone())),
            identifier: None,
            user_data: self
                .user_data
                .as_ref()
                .and_then(|data| serde_json::to_value(data).ok())
                // el nodo solo acepta objetos JSON como userData
                .filter(serde_json::Value::is_object),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Track => write!(f, "track"),
            Self::Queue => write!(f, "queue"),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn track_info(title: &str) -> TrackInfo {
        TrackInfo {
            identifier: title.to_lowercase(),
            is_seekable: true,
            author: "Open Music".into(),
            length: 180_000,
            is_stream: false,
            position: 0,
            title: title.into(),
            uri: Some(format!("https://example.com/{title}")),
            artwork_url: None,
            isrc: None,
            source_name: "youtube".into(),
        }
    }

    pub fn track(name: &str) -> Track<String> {
        Track {
            encoded: name.into(),
            info: track_info(name),
            user_data: Some(format!("user-{name}")),
        }
    }

    pub fn track_data(name: &str) -> TrackData {
        TrackData {
            encoded: name.into(),
            info: track_info(name),
            plugin_info: serde_json::Value::Null,
            user_data: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_data_recovers_echoed_user_data() {
        let mut data = track_data("A");
        data.user_data = json!("requester-42");
        let track: Track<String> = Track::from_data(data);
        assert_eq!(track.user_data.as_deref(), Some("requester-42"));

        let track: Track<String> = Track::from_data(track_data("B"));
        assert!(track.user_data.is_none());
    }

    #[test]
    fn test_update_only_forwards_object_user_data() {
        let update = track("A").to_update();
        assert_eq!(update.encoded, Some(Some("A".to_string())));
        assert_eq!(update.user_data, None);

        let track = Track {
            encoded: "B".into(),
            info: track_info("B"),
            user_data: Some(json!({"requester": 42})),
        };
        assert_eq!(track.to_update().user_data, Some(json!({"requester": 42})));
    }

    /// Datos del llamador sin `Default`
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Requester {
        id: u64,
    }

    fn decode<U: UserData>(raw: &str) -> serde_json::Result<Track<U>> {
        serde_json::from_str(raw)
    }

    #[test]
    fn test_decode_with_user_data_lacking_default() {
        let track = Track {
            encoded: "A".into(),
            info: track_info("A"),
            user_data: Some(Requester { id: 42 }),
        };
        let raw = serde_json::to_string(&track).unwrap();
        assert_eq!(decode::<Requester>(&raw).unwrap(), track);

        let bare = serde_json::to_string(&Track::<Requester> {
            user_data: None,
            ..track
        })
        .unwrap();
        assert_eq!(decode::<Requester>(&bare).unwrap().user_data, None);
    }
}
