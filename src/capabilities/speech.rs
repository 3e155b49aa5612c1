/// `capabilities/speech.rs` — `speechlib`, text-to-speech queue
///
/// The in-process queue keeps the full control surface (volume, rate, voice,
/// pause) and the banned-word filter; an audio backend drains `next_utterance`.
use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use mlua::{Lua, Table};
use regex::{Regex, RegexBuilder};

use crate::error::{HubError, HubResult};

use super::Capability;

pub const VOLUME_RANGE: (i64, i64) = (0, 100);
pub const RATE_RANGE: (i64, i64) = (-10, 10);

pub trait SpeechControl: Send + Sync {
    /// Queue `text`. Returns `false` when the filter left nothing to say.
    fn speak(&self, text: &str) -> HubResult<bool>;
    fn pause(&self);
    fn resume(&self);
    /// Drop the current utterance and everything queued.
    fn stop(&self);
    /// Drop queued utterances but let the current one finish.
    fn clear(&self);
    fn skip(&self);
    fn set_volume(&self, volume: i64);
    fn volume(&self) -> i64;
    fn set_rate(&self, rate: i64);
    fn rate(&self) -> i64;
    fn voices(&self) -> Vec<String>;
    fn select_voice(&self, voice: &str) -> HubResult<()>;
    /// Returns the number of patterns loaded.
    fn reload_banned_words(&self) -> HubResult<usize>;
}

struct SpeechState {
    queue: VecDeque<String>,
    paused: bool,
    volume: i64,
    rate: i64,
    voice: Option<String>,
}

pub struct SpeechQueue {
    state: Mutex<SpeechState>,
    voices: Vec<String>,
    banned: RwLock<Vec<Regex>>,
    banned_words_file: Option<PathBuf>,
}

impl SpeechQueue {
    pub fn new(voices: Vec<String>, banned_words_file: Option<PathBuf>) -> Self {
        let queue = Self {
            state: Mutex::new(SpeechState {
                queue: VecDeque::new(),
                paused: false,
                volume: 100,
                rate: 0,
                voice: voices.first().cloned(),
            }),
            voices,
            banned: RwLock::new(Vec::new()),
            banned_words_file,
        };
        if let Err(e) = queue.reload_banned_words() {
            log::warn!("[speech] {}", e);
        }
        queue
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SpeechState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mask every banned match with `*`.
    pub fn filter(&self, text: &str) -> String {
        let banned = self.banned.read().unwrap_or_else(PoisonError::into_inner);
        let mut filtered = text.to_string();
        let mut replaced = 0;
        for pattern in banned.iter() {
            let hits = pattern.find_iter(&filtered).count();
            if hits > 0 {
                replaced += hits;
                filtered = pattern.replace_all(&filtered, "*").into_owned();
            }
        }
        if replaced > 0 {
            log::debug!("[speech] Filtered {} banned word(s)", replaced);
        }
        filtered
    }

    /// Pop the next utterance for the audio backend. `None` while paused.
    pub fn next_utterance(&self) -> Option<String> {
        let mut state = self.state();
        if state.paused {
            return None;
        }
        state.queue.pop_front()
    }

    pub fn queued(&self) -> Vec<String> {
        self.state().queue.iter().cloned().collect()
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    pub fn selected_voice(&self) -> Option<String> {
        self.state().voice.clone()
    }
}

/// One pattern per line; blank lines and `#` comments are skipped.
fn parse_patterns(contents: &str) -> Vec<Regex> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match RegexBuilder::new(line).case_insensitive(true).build() {
            Ok(re) => Some(re),
            Err(e) => {
                log::warn!("[speech] Invalid banned word pattern '{}': {}", line, e);
                None
            }
        })
        .collect()
}

impl SpeechControl for SpeechQueue {
    fn speak(&self, text: &str) -> HubResult<bool> {
        let filtered = self.filter(text);
        if filtered.trim().is_empty() {
            log::debug!("[speech] Text filtered to empty, skipping");
            return Ok(false);
        }
        log::info!("[speech] Queued: {}", filtered);
        self.state().queue.push_back(filtered);
        Ok(true)
    }

    fn pause(&self) {
        self.state().paused = true;
    }

    fn resume(&self) {
        self.state().paused = false;
    }

    fn stop(&self) {
        let mut state = self.state();
        state.queue.clear();
        state.paused = false;
    }

    fn clear(&self) {
        let mut state = self.state();
        // keep the utterance being spoken
        state.queue.truncate(1);
    }

    fn skip(&self) {
        self.state().queue.pop_front();
    }

    fn set_volume(&self, volume: i64) {
        self.state().volume = volume.clamp(VOLUME_RANGE.0, VOLUME_RANGE.1);
    }

    fn volume(&self) -> i64 {
        self.state().volume
    }

    fn set_rate(&self, rate: i64) {
        self.state().rate = rate.clamp(RATE_RANGE.0, RATE_RANGE.1);
    }

    fn rate(&self) -> i64 {
        self.state().rate
    }

    fn voices(&self) -> Vec<String> {
        self.voices.clone()
    }

    fn select_voice(&self, voice: &str) -> HubResult<()> {
        let found = self
            .voices
            .iter()
            .find(|v| v.eq_ignore_ascii_case(voice))
            .ok_or_else(|| {
                HubError::Capability(format!(
                    "voice '{}' not found, available: {}",
                    voice,
                    self.voices.join(", ")
                ))
            })?;
        self.state().voice = Some(found.clone());
        log::info!("[speech] Voice set to {}", found);
        Ok(())
    }

    fn reload_banned_words(&self) -> HubResult<usize> {
        let Some(path) = &self.banned_words_file else {
            log::debug!("[speech] No banned words file configured");
            return Ok(0);
        };
        let contents = std::fs::read_to_string(path).map_err(|e| HubError::io(path, e))?;
        let patterns = parse_patterns(&contents);
        let count = patterns.len();
        *self.banned.write().unwrap_or_else(PoisonError::into_inner) = patterns;
        log::info!("[speech] Loaded {} banned word pattern(s) from {}", count, path.display());
        Ok(count)
    }
}

pub struct SpeechLib {
    speech: Arc<dyn SpeechControl>,
}

impl SpeechLib {
    pub fn new(speech: Arc<dyn SpeechControl>) -> Self {
        Self { speech }
    }
}

impl Capability for SpeechLib {
    fn name(&self) -> &'static str {
        "speechlib"
    }

    fn build(&self, lua: &Lua) -> mlua::Result<Table> {
        let tbl = lua.create_table()?;

        macro_rules! unit_fn {
            ($name:literal, $method:ident) => {{
                let speech = Arc::clone(&self.speech);
                tbl.set(
                    $name,
                    lua.create_function(move |_, ()| {
                        speech.$method();
                        Ok(())
                    })?,
                )?;
            }};
        }

        let speech = Arc::clone(&self.speech);
        tbl.set(
            "speak",
            lua.create_function(move |_, text: String| {
                speech.speak(&text).map_err(HubError::into_lua)
            })?,
        )?;
        unit_fn!("pause", pause);
        unit_fn!("resume", resume);
        unit_fn!("stop", stop);
        unit_fn!("clear", clear);
        unit_fn!("skip", skip);

        let speech = Arc::clone(&self.speech);
        tbl.set(
            "setvolume",
            lua.create_function(move |_, volume: i64| {
                speech.set_volume(volume);
                Ok(())
            })?,
        )?;
        let speech = Arc::clone(&self.speech);
        tbl.set("getvolume", lua.create_function(move |_, ()| Ok(speech.volume()))?)?;
        let speech = Arc::clone(&self.speech);
        tbl.set(
            "setrate",
            lua.create_function(move |_, rate: i64| {
                speech.set_rate(rate);
                Ok(())
            })?,
        )?;
        let speech = Arc::clone(&self.speech);
        tbl.set("getrate", lua.create_function(move |_, ()| Ok(speech.rate()))?)?;
        let speech = Arc::clone(&self.speech);
        tbl.set(
            "voices",
            lua.create_function(move |lua, ()| lua.create_sequence_from(speech.voices()))?,
        )?;
        let speech = Arc::clone(&self.speech);
        tbl.set(
            "selectvoice",
            lua.create_function(move |_, voice: String| {
                speech.select_voice(&voice).map_err(HubError::into_lua)
            })?,
        )?;
        let speech = Arc::clone(&self.speech);
        tbl.set(
            "reloadbwords",
            lua.create_function(move |_, ()| {
                speech.reload_banned_words().map_err(HubError::into_lua)
            })?,
        )?;

        Ok(tbl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with_banned(patterns: &str) -> (tempfile::TempDir, SpeechQueue) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("banned.txt");
        std::fs::write(&path, patterns).unwrap();
        let queue = SpeechQueue::new(vec!["Anna".into(), "David".into()], Some(path));
        (dir, queue)
    }

    #[test]
    fn banned_words_are_masked() {
        let (_dir, queue) = queue_with_banned("# comment\n\nbad\\w*\n([unclosed\n");
        assert_eq!(queue.filter("this is BADLY done"), "this is * done");
        assert!(queue.speak("hello there").unwrap());
        assert_eq!(queue.queued(), vec!["hello there"]);
    }

    #[test]
    fn blank_text_is_dropped() {
        let (_dir, queue) = queue_with_banned(".+\n");
        assert_eq!(queue.filter("anything"), "*");
        assert!(!queue.speak("   ").unwrap());
        assert!(queue.queued().is_empty());
    }

    #[test]
    fn reload_picks_up_new_patterns() {
        let (dir, queue) = queue_with_banned("foo\n");
        std::fs::write(dir.path().join("banned.txt"), "foo\nbar\n").unwrap();
        assert_eq!(queue.reload_banned_words().unwrap(), 2);
        assert_eq!(queue.filter("foo bar baz"), "* * baz");
    }

    #[test]
    fn queue_controls() {
        let queue = SpeechQueue::new(vec!["Anna".into()], None);
        for text in ["one", "two", "three"] {
            queue.speak(text).unwrap();
        }
        queue.skip();
        assert_eq!(queue.queued(), vec!["two", "three"]);
        queue.clear();
        assert_eq!(queue.queued(), vec!["two"]);

        queue.pause();
        assert_eq!(queue.next_utterance(), None);
        queue.resume();
        assert_eq!(queue.next_utterance().as_deref(), Some("two"));

        queue.speak("four").unwrap();
        queue.stop();
        assert!(queue.queued().is_empty());
    }

    #[test]
    fn volume_rate_and_voice() {
        let queue = SpeechQueue::new(vec!["Anna".into(), "David".into()], None);
        queue.set_volume(150);
        queue.set_rate(-20);
        assert_eq!((queue.volume(), queue.rate()), (100, -10));
        queue.select_voice("david").unwrap();
        assert_eq!(queue.selected_voice().as_deref(), Some("David"));
        assert!(queue.select_voice("Zira").is_err());
    }

    #[test]
    fn script_surface() {
        let lua = Lua::new();
        let queue = Arc::new(SpeechQueue::new(vec!["Anna".into(), "David".into()], None));
        let lib = SpeechLib::new(queue.clone());
        lua.globals().set("speechlib", lib.build(&lua).unwrap()).unwrap();

        let (count, first, volume): (i64, String, i64) = lua
            .load(
                r#"
                speechlib.speak("hi chat")
                speechlib.setvolume(40)
                local voices = speechlib.voices()
                return #voices, voices[1], speechlib.getvolume()
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!((count, first.as_str(), volume), (2, "Anna", 40));
        assert_eq!(queue.queued(), vec!["hi chat"]);
        assert!(lua.load("speechlib.selectvoice('nobody')").exec().is_err());
    }
}
