use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Локальный трек, полученный UI при захвате камеры/микрофона
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Захваченный локальный поток. Сам захват делает UI, сюда попадает только описание.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub stream_id: String,
    pub tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    /// Обычная камера: один аудио и один видео трек
    pub fn camera(stream_id: impl Into<String>) -> Self {
        let stream_id = stream_id.into();
        LocalMedia {
            tracks: vec![
                LocalTrack {
                    id: format!("{stream_id}-audio"),
                    kind: MediaKind::Audio,
                },
                LocalTrack {
                    id: format!("{stream_id}-video"),
                    kind: MediaKind::Video,
                },
            ],
            stream_id,
        }
    }
}

/// Дескриптор удалённого трека, который UI может отрисовать
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_id: String,
    pub kind: MediaKind,
}
