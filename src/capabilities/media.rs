/// `capabilities/media.rs` — `medialib` and the in-process media board
///
/// The board keeps one queue per configured channel and walks it through
/// Stopped → Playing ⇄ Paused. Every transition is published as a
/// `MediaEvent` on a broadcast channel; `AppState` forwards those into the
/// dispatcher so `Media*` reactions fire.
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};

use mlua::{Lua, Table};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    error::{HubError, HubResult},
    scripting::{kind::EventKind, value::EventArg},
};

use super::Capability;

pub const MIN_SPEED: f64 = 0.25;
pub const MAX_SPEED: f64 = 4.0;

/// Operations `medialib` needs from a media backend.
pub trait MediaControl: Send + Sync {
    /// Queue `source`; returns the queue length after adding.
    fn add(&self, channel: &str, source: &str) -> HubResult<usize>;
    fn start(&self, channel: &str) -> HubResult<()>;
    fn stop(&self, channel: &str) -> HubResult<()>;
    fn skip(&self, channel: &str) -> HubResult<()>;
    fn pause(&self, channel: &str) -> HubResult<()>;
    fn set_volume(&self, channel: &str, volume: i64) -> HubResult<()>;
    fn volume(&self, channel: &str) -> HubResult<i64>;
    fn set_speed(&self, channel: &str, speed: f64) -> HubResult<()>;
    fn speed(&self, channel: &str) -> HubResult<f64>;
    fn state(&self, channel: &str) -> HubResult<PlaybackState>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct MediaEvent {
    pub kind: EventKind,
    pub channel: String,
    pub source: Option<String>,
    pub position: Option<usize>,
    pub message: Option<String>,
}

impl MediaEvent {
    fn new(kind: EventKind, channel: &str, source: Option<&str>) -> Self {
        Self {
            kind,
            channel: channel.to_string(),
            source: source.map(str::to_string),
            position: None,
            message: None,
        }
    }

    /// Arguments handed to `Media*` reactions: `(channel, source[, position])`,
    /// `(channel)` for queue-finished, `(channel, source, message)` for errors.
    pub fn args(&self) -> Vec<EventArg> {
        let mut args = vec![EventArg::from(self.channel.as_str())];
        if self.kind == EventKind::MediaQueueFinish {
            return args;
        }
        args.push(
            self.source
                .as_deref()
                .map(EventArg::from)
                .unwrap_or(EventArg::Nil),
        );
        match self.kind {
            EventKind::MediaAdd => {
                if let Some(pos) = self.position {
                    args.push(EventArg::Int(pos as i64));
                }
            }
            EventKind::MediaError => {
                args.push(EventArg::from(self.message.clone().unwrap_or_default()));
            }
            _ => {}
        }
        args
    }
}

// ── MediaBoard ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Channel {
    queue: VecDeque<String>,
    current: Option<String>,
    state: PlaybackState,
    volume: i64,
    speed: f64,
}

impl Channel {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            current: None,
            state: PlaybackState::Stopped,
            volume: 100,
            speed: 1.0,
        }
    }
}

pub struct MediaBoard {
    channels: HashMap<String, Mutex<Channel>>,
    events: broadcast::Sender<MediaEvent>,
}

impl MediaBoard {
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (events, _) = broadcast::channel(256);
        Self {
            channels: channels
                .into_iter()
                .map(|name| (name.into(), Mutex::new(Channel::new())))
                .collect(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn current(&self, channel: &str) -> HubResult<Option<String>> {
        self.with_channel(channel, |ch| Ok(ch.current.clone()))
    }

    pub fn queue_len(&self, channel: &str) -> HubResult<usize> {
        self.with_channel(channel, |ch| Ok(ch.queue.len()))
    }

    /// The backend finished the current item: report it and move on.
    pub fn end_reached(&self, channel: &str) -> HubResult<()> {
        self.with_channel(channel, |ch| {
            if let Some(current) = ch.current.clone() {
                self.emit(MediaEvent::new(EventKind::MediaEnd, channel, Some(&current)));
            }
            self.play_next(channel, ch);
            Ok(())
        })
    }

    fn emit(&self, event: MediaEvent) {
        log::debug!("[media] {} on '{}' ({:?})", event.kind, event.channel, event.source);
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn with_channel<T>(
        &self,
        channel: &str,
        f: impl FnOnce(&mut Channel) -> HubResult<T>,
    ) -> HubResult<T> {
        match self.channels.get(channel) {
            Some(ch) => f(&mut ch.lock().unwrap_or_else(PoisonError::into_inner)),
            None => {
                let message = format!("media channel '{channel}' does not exist");
                let mut event = MediaEvent::new(EventKind::MediaError, channel, None);
                event.message = Some(message.clone());
                self.emit(event);
                Err(HubError::Capability(message))
            }
        }
    }

    fn play_next(&self, channel: &str, ch: &mut Channel) {
        match ch.queue.pop_front() {
            Some(next) => {
                ch.state = PlaybackState::Playing;
                self.emit(MediaEvent::new(EventKind::MediaStart, channel, Some(&next)));
                ch.current = Some(next);
            }
            None => {
                ch.current = None;
                ch.state = PlaybackState::Stopped;
                self.emit(MediaEvent::new(EventKind::MediaQueueFinish, channel, None));
            }
        }
    }
}

impl MediaControl for MediaBoard {
    fn add(&self, channel: &str, source: &str) -> HubResult<usize> {
        let source = source.trim();
        if source.is_empty() {
            let mut event = MediaEvent::new(EventKind::MediaError, channel, Some(source));
            event.message = Some("empty media source".into());
            self.emit(event);
            return Err(HubError::Capability("media source must not be empty".into()));
        }
        self.with_channel(channel, |ch| {
            ch.queue.push_back(source.to_string());
            let len = ch.queue.len();
            let mut event = MediaEvent::new(EventKind::MediaAdd, channel, Some(source));
            event.position = Some(len);
            self.emit(event);
            if ch.state == PlaybackState::Stopped && ch.current.is_none() {
                self.play_next(channel, ch);
            }
            Ok(len)
        })
    }

    fn start(&self, channel: &str) -> HubResult<()> {
        self.with_channel(channel, |ch| {
            match (ch.state, ch.current.clone()) {
                (PlaybackState::Playing, _) => {}
                (_, Some(current)) => {
                    ch.state = PlaybackState::Playing;
                    self.emit(MediaEvent::new(EventKind::MediaStart, channel, Some(&current)));
                }
                (_, None) => self.play_next(channel, ch),
            }
            Ok(())
        })
    }

    fn stop(&self, channel: &str) -> HubResult<()> {
        self.with_channel(channel, |ch| {
            if ch.state != PlaybackState::Stopped {
                ch.state = PlaybackState::Stopped;
                self.emit(MediaEvent::new(EventKind::MediaStop, channel, ch.current.as_deref()));
            }
            Ok(())
        })
    }

    fn skip(&self, channel: &str) -> HubResult<()> {
        self.with_channel(channel, |ch| {
            let skipped = ch.current.take();
            self.emit(MediaEvent::new(EventKind::MediaSkip, channel, skipped.as_deref()));
            self.play_next(channel, ch);
            Ok(())
        })
    }

    /// Pauses while playing, resumes while paused.
    fn pause(&self, channel: &str) -> HubResult<()> {
        self.with_channel(channel, |ch| {
            match ch.state {
                PlaybackState::Playing => {
                    ch.state = PlaybackState::Paused;
                    self.emit(MediaEvent::new(EventKind::MediaPause, channel, ch.current.as_deref()));
                }
                PlaybackState::Paused => {
                    ch.state = PlaybackState::Playing;
                    self.emit(MediaEvent::new(EventKind::MediaStart, channel, ch.current.as_deref()));
                }
                PlaybackState::Stopped => {}
            }
            Ok(())
        })
    }

    fn set_volume(&self, channel: &str, volume: i64) -> HubResult<()> {
        self.with_channel(channel, |ch| {
            ch.volume = volume.clamp(0, 100);
            Ok(())
        })
    }

    fn volume(&self, channel: &str) -> HubResult<i64> {
        self.with_channel(channel, |ch| Ok(ch.volume))
    }

    fn set_speed(&self, channel: &str, speed: f64) -> HubResult<()> {
        self.with_channel(channel, |ch| {
            ch.speed = if speed.is_finite() {
                speed.clamp(MIN_SPEED, MAX_SPEED)
            } else {
                1.0
            };
            Ok(())
        })
    }

    fn speed(&self, channel: &str) -> HubResult<f64> {
        self.with_channel(channel, |ch| Ok(ch.speed))
    }

    fn state(&self, channel: &str) -> HubResult<PlaybackState> {
        self.with_channel(channel, |ch| Ok(ch.state))
    }
}

// ── medialib ──────────────────────────────────────────────────────────────────

pub struct MediaLib {
    media: Arc<dyn MediaControl>,
}

impl MediaLib {
    pub fn new(media: Arc<dyn MediaControl>) -> Self {
        Self { media }
    }
}

impl Capability for MediaLib {
    fn name(&self) -> &'static str {
        "medialib"
    }

    fn build(&self, lua: &Lua) -> mlua::Result<Table> {
        let tbl = lua.create_table()?;

        let media = Arc::clone(&self.media);
        tbl.set(
            "add",
            lua.create_function(move |_, (channel, source): (String, String)| {
                media.add(&channel, &source).map_err(HubError::into_lua)
            })?,
        )?;

        macro_rules! channel_fn {
            ($name:literal, $method:ident) => {{
                let media = Arc::clone(&self.media);
                tbl.set(
                    $name,
                    lua.create_function(move |_, channel: String| {
                        media.$method(&channel).map_err(HubError::into_lua)
                    })?,
                )?;
            }};
        }
        channel_fn!("start", start);
        channel_fn!("stop", stop);
        channel_fn!("skip", skip);
        channel_fn!("pause", pause);
        channel_fn!("getvolume", volume);
        channel_fn!("getspeed", speed);

        let media = Arc::clone(&self.media);
        tbl.set(
            "setvolume",
            lua.create_function(move |_, (channel, volume): (String, i64)| {
                media.set_volume(&channel, volume).map_err(HubError::into_lua)
            })?,
        )?;
        let media = Arc::clone(&self.media);
        tbl.set(
            "setspeed",
            lua.create_function(move |_, (channel, speed): (String, f64)| {
                media.set_speed(&channel, speed).map_err(HubError::into_lua)
            })?,
        )?;

        macro_rules! state_fn {
            ($name:literal, $state:expr) => {{
                let media = Arc::clone(&self.media);
                tbl.set(
                    $name,
                    lua.create_function(move |_, channel: String| {
                        media
                            .state(&channel)
                            .map(|s| s == $state)
                            .map_err(HubError::into_lua)
                    })?,
                )?;
            }};
        }
        state_fn!("isplaying", PlaybackState::Playing);
        state_fn!("ispaused", PlaybackState::Paused);
        state_fn!("isstopped", PlaybackState::Stopped);

        Ok(tbl)
    }
}
