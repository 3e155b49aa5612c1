/// `scripting/kind.rs` — event categories a reaction can be bound to
///
/// Producers (chat client, input hook, media board, clip poller) and script
/// authors share this vocabulary: a reaction file declares `kind = "Follow"`,
/// the follow producer dispatches `EventKind::Follow`.
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Uninitialised / invalid. Never parsed from a declaration.
    None,

    // Twitch
    Command,
    Reward,
    Message,
    Follow,
    Subscribe,
    GiftSubscribe,
    Cheer,
    StreamOn,
    StreamOff,
    Clip,

    // Hardware
    KeyDown,
    KeyUp,
    KeyType,
    MouseDown,
    MouseUp,
    MouseClick,
    MouseMove,
    MouseWheel,

    // Media
    MediaAdd,
    MediaStart,
    MediaSkip,
    MediaPause,
    MediaStop,
    MediaEnd,
    MediaQueueFinish,
    MediaError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindFamily {
    Twitch,
    Hardware,
    Media,
}

impl EventKind {
    /// Every dispatchable kind, in code order.
    pub const ALL: [EventKind; 26] = [
        EventKind::Command,
        EventKind::Reward,
        EventKind::Message,
        EventKind::Follow,
        EventKind::Subscribe,
        EventKind::GiftSubscribe,
        EventKind::Cheer,
        EventKind::StreamOn,
        EventKind::StreamOff,
        EventKind::Clip,
        EventKind::KeyDown,
        EventKind::KeyUp,
        EventKind::KeyType,
        EventKind::MouseDown,
        EventKind::MouseUp,
        EventKind::MouseClick,
        EventKind::MouseMove,
        EventKind::MouseWheel,
        EventKind::MediaAdd,
        EventKind::MediaStart,
        EventKind::MediaSkip,
        EventKind::MediaPause,
        EventKind::MediaStop,
        EventKind::MediaEnd,
        EventKind::MediaQueueFinish,
        EventKind::MediaError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::None => "None",
            EventKind::Command => "Command",
            EventKind::Reward => "Reward",
            EventKind::Message => "Message",
            EventKind::Follow => "Follow",
            EventKind::Subscribe => "Subscribe",
            EventKind::GiftSubscribe => "GiftSubscribe",
            EventKind::Cheer => "Cheer",
            EventKind::StreamOn => "StreamOn",
            EventKind::StreamOff => "StreamOff",
            EventKind::Clip => "Clip",
            EventKind::KeyDown => "KeyDown",
            EventKind::KeyUp => "KeyUp",
            EventKind::KeyType => "KeyType",
            EventKind::MouseDown => "MouseDown",
            EventKind::MouseUp => "MouseUp",
            EventKind::MouseClick => "MouseClick",
            EventKind::MouseMove => "MouseMove",
            EventKind::MouseWheel => "MouseWheel",
            EventKind::MediaAdd => "MediaAdd",
            EventKind::MediaStart => "MediaStart",
            EventKind::MediaSkip => "MediaSkip",
            EventKind::MediaPause => "MediaPause",
            EventKind::MediaStop => "MediaStop",
            EventKind::MediaEnd => "MediaEnd",
            EventKind::MediaQueueFinish => "MediaQueueFinish",
            EventKind::MediaError => "MediaError",
        }
    }

    /// Integer code accepted in declarations (`kind = 3`). `None` has no code.
    pub fn code(self) -> Option<i64> {
        Self::ALL
            .iter()
            .position(|k| *k == self)
            .map(|idx| idx as i64)
    }

    pub fn from_code(code: i64) -> Option<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
    }

    /// Case-insensitive name lookup, including the names older reaction
    /// files were written against (`Cheers`, `OnMediaAdded`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        if let Some(kind) = Self::ALL
            .iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(name))
        {
            return Some(*kind);
        }
        let alias = match name.to_ascii_lowercase().as_str() {
            "cheers" => EventKind::Cheer,
            "onmediaadded" => EventKind::MediaAdd,
            "onmediastarted" => EventKind::MediaStart,
            "onmediaskipped" => EventKind::MediaSkip,
            "onmediapaused" => EventKind::MediaPause,
            "onmediastopped" => EventKind::MediaStop,
            "onmediaendreached" => EventKind::MediaEnd,
            "queuefinished" => EventKind::MediaQueueFinish,
            "onerror" => EventKind::MediaError,
            _ => return None,
        };
        Some(alias)
    }

    pub fn family(self) -> Option<KindFamily> {
        match self.code()? {
            0..=9 => Some(KindFamily::Twitch),
            10..=17 => Some(KindFamily::Hardware),
            _ => Some(KindFamily::Media),
        }
    }
}

impl Default for EventKind {
    fn default() -> Self {
        Self::None
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_match_case_insensitively() {
        assert_eq!(EventKind::from_name("follow"), Some(EventKind::Follow));
        assert_eq!(EventKind::from_name("FOLLOW"), Some(EventKind::Follow));
        assert_eq!(EventKind::from_name(" MediaQueueFinish "), Some(EventKind::MediaQueueFinish));
    }

    #[test]
    fn legacy_names_still_resolve() {
        assert_eq!(EventKind::from_name("Cheers"), Some(EventKind::Cheer));
        assert_eq!(EventKind::from_name("OnMediaEndReached"), Some(EventKind::MediaEnd));
        assert_eq!(EventKind::from_name("queuefinished"), Some(EventKind::MediaQueueFinish));
    }

    #[test]
    fn none_is_never_parsed() {
        assert_eq!(EventKind::from_name("None"), None);
        assert_eq!(EventKind::None.code(), None);
        assert_eq!(EventKind::from_code(-1), None);
        assert_eq!(EventKind::from_code(26), None);
    }

    #[test]
    fn codes_follow_family_order() {
        assert_eq!(EventKind::from_code(0), Some(EventKind::Command));
        assert_eq!(EventKind::from_code(10), Some(EventKind::KeyDown));
        assert_eq!(EventKind::from_code(18), Some(EventKind::MediaAdd));
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_code(kind.code().unwrap()), Some(kind));
        }
    }

    #[test]
    fn families() {
        assert_eq!(EventKind::Clip.family(), Some(KindFamily::Twitch));
        assert_eq!(EventKind::MouseWheel.family(), Some(KindFamily::Hardware));
        assert_eq!(EventKind::MediaError.family(), Some(KindFamily::Media));
        assert_eq!(EventKind::None.family(), None);
    }
}
