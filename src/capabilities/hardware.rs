/// `capabilities/hardware.rs` — `hardwarelib`: keyboard/mouse simulation
///
/// Key codes are the uiohook virtual codes (`A` = 0x1E, `Enter` = 0x1C, ...),
/// mouse buttons are 1 = left, 2 = right, 3 = middle. `BlockedInputs` is
/// shared with input producers: a hook consults it before dispatching.
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use mlua::{Lua, Table};

use crate::error::{HubError, HubResult};

use super::Capability;

pub const KEY_UNDEFINED: u16 = 0;
pub const NO_BUTTON: u8 = 0;

/// Holds shorter than this degrade to a single tap/click.
const HOLD_MIN: Duration = Duration::from_millis(300);
const HOLD_STEP: Duration = Duration::from_millis(100);

const KEY_CODES: &[(&str, u16)] = &[
    ("Escape", 0x0001),
    ("1", 0x0002),
    ("2", 0x0003),
    ("3", 0x0004),
    ("4", 0x0005),
    ("5", 0x0006),
    ("6", 0x0007),
    ("7", 0x0008),
    ("8", 0x0009),
    ("9", 0x000A),
    ("0", 0x000B),
    ("Minus", 0x000C),
    ("Equals", 0x000D),
    ("Backspace", 0x000E),
    ("Tab", 0x000F),
    ("Q", 0x0010),
    ("W", 0x0011),
    ("E", 0x0012),
    ("R", 0x0013),
    ("T", 0x0014),
    ("Y", 0x0015),
    ("U", 0x0016),
    ("I", 0x0017),
    ("O", 0x0018),
    ("P", 0x0019),
    ("OpenBracket", 0x001A),
    ("CloseBracket", 0x001B),
    ("Enter", 0x001C),
    ("LeftControl", 0x001D),
    ("A", 0x001E),
    ("S", 0x001F),
    ("D", 0x0020),
    ("F", 0x0021),
    ("G", 0x0022),
    ("H", 0x0023),
    ("J", 0x0024),
    ("K", 0x0025),
    ("L", 0x0026),
    ("Semicolon", 0x0027),
    ("Quote", 0x0028),
    ("BackQuote", 0x0029),
    ("LeftShift", 0x002A),
    ("BackSlash", 0x002B),
    ("Z", 0x002C),
    ("X", 0x002D),
    ("C", 0x002E),
    ("V", 0x002F),
    ("B", 0x0030),
    ("N", 0x0031),
    ("M", 0x0032),
    ("Comma", 0x0033),
    ("Period", 0x0034),
    ("Slash", 0x0035),
    ("RightShift", 0x0036),
    ("LeftAlt", 0x0038),
    ("Space", 0x0039),
    ("CapsLock", 0x003A),
    ("F1", 0x003B),
    ("F2", 0x003C),
    ("F3", 0x003D),
    ("F4", 0x003E),
    ("F5", 0x003F),
    ("F6", 0x0040),
    ("F7", 0x0041),
    ("F8", 0x0042),
    ("F9", 0x0043),
    ("F10", 0x0044),
    ("F11", 0x0057),
    ("F12", 0x0058),
    ("Home", 0x0E47),
    ("PageUp", 0x0E49),
    ("End", 0x0E4F),
    ("PageDown", 0x0E51),
    ("Insert", 0x0E52),
    ("Delete", 0x0E53),
    ("Up", 0xE048),
    ("Left", 0xE04B),
    ("Right", 0xE04D),
    ("Down", 0xE050),
];

/// `"a"`, `"A"`, `"VcA"` → 0x1E. Unknown names give `KEY_UNDEFINED`.
pub fn parse_key_code(name: &str) -> u16 {
    let mut name = name.trim();
    if name.len() > 2 && name.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("vc")) {
        name = name[2..].trim();
    }
    KEY_CODES
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, code)| *code)
        .unwrap_or(KEY_UNDEFINED)
}

pub fn parse_mouse_button(name: &str) -> u8 {
    match name.trim().to_ascii_lowercase().as_str() {
        "l" | "left" => 1,
        "r" | "right" => 2,
        "m" | "mid" | "middle" => 3,
        _ => NO_BUTTON,
    }
}

pub(crate) fn normalize_key(code: i64) -> u16 {
    u16::try_from(code)
        .ok()
        .filter(|c| KEY_CODES.iter().any(|(_, k)| k == c))
        .unwrap_or(KEY_UNDEFINED)
}

pub(crate) fn normalize_button(code: i64) -> u8 {
    match code {
        1..=5 => code as u8,
        _ => NO_BUTTON,
    }
}

// ── Simulation backend ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum InputAction {
    KeyDown(u16),
    KeyUp(u16),
    Text(String),
    MouseDown(u8),
    MouseUp(u8),
    ScrollVertical(i32),
    ScrollHorizontal(i32),
    MoveTo(i32, i32),
    MoveBy(i32, i32),
}

/// Primitive input injection. Compound actions (tap, click, hold) are built
/// on top of these by the binding.
pub trait HardwareControl: Send + Sync {
    fn perform(&self, action: InputAction) -> HubResult<()>;
}

/// Records and logs actions instead of touching the OS. Stands in where no
/// input backend is wired up.
#[derive(Default)]
pub struct SimulatedInput {
    history: Mutex<Vec<InputAction>>,
}

impl SimulatedInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<InputAction> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl HardwareControl for SimulatedInput {
    fn perform(&self, action: InputAction) -> HubResult<()> {
        match &action {
            InputAction::KeyDown(KEY_UNDEFINED) | InputAction::KeyUp(KEY_UNDEFINED) => {
                return Err(HubError::Capability("undefined key code".into()))
            }
            InputAction::MouseDown(NO_BUTTON) | InputAction::MouseUp(NO_BUTTON) => {
                return Err(HubError::Capability("undefined mouse button".into()))
            }
            _ => {}
        }
        log::debug!("[hardware] {:?}", action);
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(action);
        Ok(())
    }
}

// ── Blocked inputs ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct BlockedInputs {
    keys: Mutex<HashSet<u16>>,
    buttons: Mutex<HashSet<u8>>,
}

impl BlockedInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_key_blocked(&self, key: u16) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key)
    }

    pub fn set_key_blocked(&self, key: u16, blocked: bool) {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if blocked {
            keys.insert(key);
        } else {
            keys.remove(&key);
        }
    }

    /// Returns the new state.
    pub fn toggle_key(&self, key: u16) -> bool {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if keys.remove(&key) {
            false
        } else {
            keys.insert(key);
            true
        }
    }

    pub fn is_button_blocked(&self, button: u8) -> bool {
        self.buttons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&button)
    }

    pub fn set_button_blocked(&self, button: u8, blocked: bool) {
        let mut buttons = self.buttons.lock().unwrap_or_else(PoisonError::into_inner);
        if blocked {
            buttons.insert(button);
        } else {
            buttons.remove(&button);
        }
    }

    pub fn toggle_button(&self, button: u8) -> bool {
        let mut buttons = self.buttons.lock().unwrap_or_else(PoisonError::into_inner);
        if buttons.remove(&button) {
            false
        } else {
            buttons.insert(button);
            true
        }
    }
}

// ── hardwarelib ───────────────────────────────────────────────────────────────

pub struct HardwareLib {
    input: Arc<dyn HardwareControl>,
    blocked: Arc<BlockedInputs>,
}

impl HardwareLib {
    pub fn new(input: Arc<dyn HardwareControl>, blocked: Arc<BlockedInputs>) -> Self {
        Self { input, blocked }
    }
}

/// One press/release pair.
fn tap(input: &dyn HardwareControl, down: InputAction, up: InputAction) -> HubResult<()> {
    input.perform(down)?;
    input.perform(up)
}

/// Press/release every `HOLD_STEP` until `duration` has passed. Short holds
/// collapse to one tap. Sleeps suspend the calling script only.
async fn hold(
    input: Arc<dyn HardwareControl>,
    down: InputAction,
    up: InputAction,
    duration: Duration,
) -> HubResult<()> {
    if duration < HOLD_MIN {
        return tap(input.as_ref(), down, up);
    }
    let end = Instant::now() + duration;
    while Instant::now() < end {
        input.perform(down.clone())?;
        tokio::time::sleep(HOLD_STEP).await;
        input.perform(up.clone())?;
    }
    Ok(())
}

fn duration_ms(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

impl Capability for HardwareLib {
    fn name(&self) -> &'static str {
        "hardwarelib"
    }

    fn build(&self, lua: &Lua) -> mlua::Result<Table> {
        let tbl = lua.create_table()?;

        let codes = lua.create_table()?;
        for (name, code) in KEY_CODES {
            codes.set(*name, *code)?;
            codes.set(name.to_ascii_lowercase(), *code)?;
        }
        tbl.set("keycodes", codes)?;
        tbl.set("parsekeycode", lua.create_function(|_, name: String| Ok(parse_key_code(&name)))?)?;
        tbl.set(
            "parsemousebutton",
            lua.create_function(|_, name: String| Ok(parse_mouse_button(&name)))?,
        )?;

        macro_rules! action_fn {
            ($name:literal, |$($arg:ident : $ty:ty),*| $action:expr) => {{
                let input = Arc::clone(&self.input);
                tbl.set(
                    $name,
                    lua.create_function(move |_, ($($arg,)*): ($($ty,)*)| {
                        input.perform($action).map_err(HubError::into_lua)
                    })?,
                )?;
            }};
        }

        // Keyboard
        action_fn!("keydown", |code: i64| InputAction::KeyDown(normalize_key(code)));
        action_fn!("keyup", |code: i64| InputAction::KeyUp(normalize_key(code)));
        action_fn!("typetext", |text: String| InputAction::Text(text));
        let input = Arc::clone(&self.input);
        tbl.set(
            "keytap",
            lua.create_function(move |_, code: i64| {
                let key = normalize_key(code);
                tap(input.as_ref(), InputAction::KeyDown(key), InputAction::KeyUp(key))
                    .map_err(HubError::into_lua)
            })?,
        )?;
        let input = Arc::clone(&self.input);
        tbl.set(
            "keyhold",
            lua.create_async_function(move |_, (code, ms): (i64, i64)| {
                let input = Arc::clone(&input);
                let key = normalize_key(code);
                async move {
                    hold(input, InputAction::KeyDown(key), InputAction::KeyUp(key), duration_ms(ms))
                        .await
                        .map_err(HubError::into_lua)
                }
            })?,
        )?;

        // Mouse
        action_fn!("mousedown", |button: i64| InputAction::MouseDown(normalize_button(button)));
        action_fn!("mouseup", |button: i64| InputAction::MouseUp(normalize_button(button)));
        action_fn!("scrollvertical", |delta: i32| InputAction::ScrollVertical(delta));
        action_fn!("scrollhorizontal", |delta: i32| InputAction::ScrollHorizontal(delta));
        action_fn!("setmouseposition", |x: i32, y: i32| InputAction::MoveTo(x, y));
        action_fn!("movemouse", |dx: i32, dy: i32| InputAction::MoveBy(dx, dy));
        let input = Arc::clone(&self.input);
        tbl.set(
            "mouseclick",
            lua.create_function(move |_, button: i64| {
                let b = normalize_button(button);
                tap(input.as_ref(), InputAction::MouseDown(b), InputAction::MouseUp(b))
                    .map_err(HubError::into_lua)
            })?,
        )?;
        let input = Arc::clone(&self.input);
        tbl.set(
            "mousehold",
            lua.create_async_function(move |_, (button, ms): (i64, i64)| {
                let input = Arc::clone(&input);
                let b = normalize_button(button);
                async move {
                    hold(input, InputAction::MouseDown(b), InputAction::MouseUp(b), duration_ms(ms))
                        .await
                        .map_err(HubError::into_lua)
                }
            })?,
        )?;

        // Blocking
        let blocked = Arc::clone(&self.blocked);
        tbl.set(
            "blockkey",
            lua.create_function(move |_, code: i64| {
                blocked.set_key_blocked(normalize_key(code), true);
                Ok(())
            })?,
        )?;
        let blocked = Arc::clone(&self.blocked);
        tbl.set(
            "unblockkey",
            lua.create_function(move |_, code: i64| {
                blocked.set_key_blocked(normalize_key(code), false);
                Ok(())
            })?,
        )?;
        let blocked = Arc::clone(&self.blocked);
        tbl.set(
            "togglekey",
            lua.create_function(move |_, code: i64| Ok(blocked.toggle_key(normalize_key(code))))?,
        )?;
        let blocked = Arc::clone(&self.blocked);
        tbl.set(
            "iskeyblocked",
            lua.create_function(move |_, code: i64| Ok(blocked.is_key_blocked(normalize_key(code))))?,
        )?;
        let blocked = Arc::clone(&self.blocked);
        tbl.set(
            "blockbutton",
            lua.create_function(move |_, button: i64| {
                blocked.set_button_blocked(normalize_button(button), true);
                Ok(())
            })?,
        )?;
        let blocked = Arc::clone(&self.blocked);
        tbl.set(
            "unblockbutton",
            lua.create_function(move |_, button: i64| {
                blocked.set_button_blocked(normalize_button(button), false);
                Ok(())
            })?,
        )?;
        let blocked = Arc::clone(&self.blocked);
        tbl.set(
            "togglebutton",
            lua.create_function(move |_, button: i64| Ok(blocked.toggle_button(normalize_button(button))))?,
        )?;
        let blocked = Arc::clone(&self.blocked);
        tbl.set(
            "isbuttonblocked",
            lua.create_function(move |_, button: i64| {
                Ok(blocked.is_button_blocked(normalize_button(button)))
            })?,
        )?;

        Ok(tbl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Lua, Arc<SimulatedInput>, Arc<BlockedInputs>) {
        let input = Arc::new(SimulatedInput::new());
        let blocked = Arc::new(BlockedInputs::new());
        let lua = Lua::new();
        let lib = HardwareLib::new(input.clone(), Arc::clone(&blocked));
        lua.globals().set("hardwarelib", lib.build(&lua).unwrap()).unwrap();
        (lua, input, blocked)
    }

    #[test]
    fn key_names_parse() {
        assert_eq!(parse_key_code("a"), 0x1E);
        assert_eq!(parse_key_code("VcEnter"), 0x1C);
        assert_eq!(parse_key_code(" f12 "), 0x58);
        assert_eq!(parse_key_code("nope"), KEY_UNDEFINED);
        assert_eq!(parse_key_code("€a"), KEY_UNDEFINED);
        assert_eq!(parse_key_code("vé"), KEY_UNDEFINED);
        assert_eq!(parse_mouse_button("Right"), 2);
        assert_eq!(parse_mouse_button("thumb"), NO_BUTTON);
    }

    #[tokio::test]
    async fn tap_and_click_are_press_release_pairs() {
        let (lua, input, _) = setup();
        lua.load(
            r#"
            hardwarelib.keytap(hardwarelib.keycodes.a)
            hardwarelib.mouseclick(hardwarelib.parsemousebutton("left"))
            hardwarelib.keyhold(hardwarelib.keycodes.Space, 50)
            "#,
        )
        .exec_async()
        .await
        .unwrap();
        assert_eq!(
            input.history(),
            vec![
                InputAction::KeyDown(0x1E),
                InputAction::KeyUp(0x1E),
                InputAction::MouseDown(1),
                InputAction::MouseUp(1),
                InputAction::KeyDown(0x39),
                InputAction::KeyUp(0x39),
            ]
        );
    }

    #[tokio::test]
    async fn long_hold_repeats() {
        let (lua, input, _) = setup();
        lua.load("hardwarelib.mousehold(1, 320)").exec_async().await.unwrap();
        let presses = input
            .history()
            .iter()
            .filter(|a| **a == InputAction::MouseDown(1))
            .count();
        assert!(presses >= 3, "{presses}");
    }

    #[test]
    fn undefined_key_raises() {
        let (lua, _, _) = setup();
        assert!(lua.load("hardwarelib.keydown(9999)").exec().is_err());
    }

    #[test]
    fn blocking_is_shared_with_host() {
        let (lua, _, blocked) = setup();
        let toggled: bool = lua
            .load(
                r#"
                hardwarelib.blockkey(hardwarelib.keycodes.w)
                hardwarelib.blockbutton(2)
                return hardwarelib.togglekey(hardwarelib.keycodes.w)
                "#,
            )
            .eval()
            .unwrap();
        assert!(!toggled);
        assert!(!blocked.is_key_blocked(0x11));
        assert!(blocked.is_button_blocked(2));
        blocked.set_key_blocked(0x11, true);
        let seen: bool = lua.load("return hardwarelib.iskeyblocked(17)").eval().unwrap();
        assert!(seen);
    }
}
