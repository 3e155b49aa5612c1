/// `capabilities/utils.rs` — `utilslib`
///
/// Random helpers, table/string helpers and date/time arithmetic. Every
/// timestamp crossing this boundary is Unix milliseconds; the `*utc`
/// variants only change how an instant is rendered or decomposed.
use std::time::Duration;

use chrono::{
    format::{Item, StrftimeItems},
    DateTime, Datelike, Local, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use mlua::{Lua, Table, Value};
use rand::{seq::SliceRandom, Rng};

use crate::scripting::value::{lua_value_to_json, ScriptValue};

use super::{
    logger::{format_template, table_args},
    Capability,
};

pub const RANDOM_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
pub const DEFAULT_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct UtilsLib;

impl Capability for UtilsLib {
    fn name(&self) -> &'static str {
        "utilslib"
    }

    fn build(&self, lua: &Lua) -> mlua::Result<Table> {
        let tbl = lua.create_table()?;

        // ── Random ───────────────────────────────────────────────────────────
        tbl.set(
            "randomnumber",
            lua.create_function(|_, (min, max): (i64, i64)| Ok(random_number(min, max)))?,
        )?;
        tbl.set(
            "randomdouble",
            lua.create_function(|_, (min, max): (f64, f64)| {
                Ok(min + (max - min) * rand::thread_rng().gen::<f64>())
            })?,
        )?;
        tbl.set(
            "randomstring",
            lua.create_function(|_, len: i64| Ok(random_string(len)))?,
        )?;
        tbl.set(
            "randomposition",
            lua.create_function(|lua, (minx, maxx, miny, maxy): (i64, i64, i64, i64)| {
                let pos = lua.create_table()?;
                pos.set("X", random_number(minx, maxx))?;
                pos.set("Y", random_number(miny, maxy))?;
                Ok(pos)
            })?,
        )?;

        // Suspends the calling coroutine; the VM is free while it sleeps.
        tbl.set(
            "delay",
            lua.create_async_function(|_, ms: u64| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(())
            })?,
        )?;

        // ── Tables ───────────────────────────────────────────────────────────
        tbl.set("isluaarray", lua.create_function(|_, t: Table| is_array(&t))?)?;
        let is_empty = lua.create_function(|_, t: Table| Ok(entries(&t)?.is_empty()))?;
        tbl.set("istableempty", is_empty.clone())?;
        // older scripts use the misspelled name
        tbl.set("istableemty", is_empty)?;
        tbl.set(
            "tablecontains",
            lua.create_function(|_, (t, needle): (Table, Value)| {
                Ok(entries(&t)?.into_iter().any(|(_, v)| v == needle))
            })?,
        )?;
        tbl.set(
            "tablerandom",
            lua.create_function(|_, t: Table| {
                let values: Vec<Value> = entries(&t)?.into_iter().map(|(_, v)| v).collect();
                Ok(values.choose(&mut rand::thread_rng()).cloned().unwrap_or(Value::Nil))
            })?,
        )?;
        tbl.set("tablecopy", lua.create_function(|lua, t: Table| table_copy(lua, &t))?)?;
        tbl.set(
            "tableshuffle",
            lua.create_function(|lua, t: Table| {
                let copy = table_copy(lua, &t)?;
                let len = copy.raw_len();
                let mut items = Vec::with_capacity(len);
                for i in 1..=len {
                    items.push(copy.raw_get::<Value>(i)?);
                }
                items.shuffle(&mut rand::thread_rng());
                for (i, v) in items.into_iter().enumerate() {
                    copy.raw_set(i + 1, v)?;
                }
                Ok(copy)
            })?,
        )?;
        tbl.set(
            "tablejoin",
            lua.create_function(|_, (t, sep): (Table, Option<String>)| {
                let sep = sep.unwrap_or_else(|| ", ".into());
                let parts: Vec<String> = if is_array(&t)? {
                    table_args(t)?
                } else {
                    entries(&t)?
                        .into_iter()
                        .map(|(k, v)| format!("[{}]: {}", ScriptValue::from(k), ScriptValue::from(v)))
                        .collect()
                };
                Ok(parts.join(&sep))
            })?,
        )?;
        tbl.set(
            "tabletojson",
            lua.create_function(|_, t: Table| Ok(lua_value_to_json(&Value::Table(t)).to_string()))?,
        )?;

        // ── Strings ──────────────────────────────────────────────────────────
        tbl.set(
            "stringsplit",
            lua.create_function(|lua, (s, delim): (String, Option<String>)| {
                let delim = delim.filter(|d| !d.is_empty()).unwrap_or_else(|| " ".into());
                lua.create_sequence_from(string_split(&s, &delim))
            })?,
        )?;
        tbl.set(
            "stringfmt",
            lua.create_function(|_, (template, args): (String, Option<Table>)| {
                let args = args.map(table_args).transpose()?.unwrap_or_default();
                Ok(format_template(&template, &args))
            })?,
        )?;

        // ── Date / time ──────────────────────────────────────────────────────
        let now = lua.create_function(|_, ()| Ok(Utc::now().timestamp_millis()))?;
        tbl.set("getcurrenttime", now.clone())?;
        tbl.set("getcurrenttimeutc", now)?;
        tbl.set(
            "formatdatetime",
            lua.create_function(|_, (ms, fmt): (i64, Option<String>)| {
                Ok(format_millis(ms, fmt.as_deref(), false))
            })?,
        )?;
        tbl.set(
            "formatdatetimeutc",
            lua.create_function(|_, (ms, fmt): (i64, Option<String>)| {
                Ok(format_millis(ms, fmt.as_deref(), true))
            })?,
        )?;
        tbl.set(
            "parsedatetime",
            lua.create_function(|_, s: String| Ok(parse_datetime(&s)))?,
        )?;
        tbl.set(
            "getdatetimecomponents",
            lua.create_function(|lua, ms: i64| {
                let Some(dt) = DateTime::from_timestamp_millis(ms) else {
                    return Ok(Value::Nil);
                };
                let dt = dt.with_timezone(&Local);
                let parts = lua.create_table()?;
                parts.set("Year", dt.year())?;
                parts.set("Month", dt.month())?;
                parts.set("Day", dt.day())?;
                parts.set("Hour", dt.hour())?;
                parts.set("Minute", dt.minute())?;
                parts.set("Second", dt.second())?;
                parts.set("Millisecond", dt.timestamp_subsec_millis())?;
                parts.set("DayOfWeek", dt.weekday().num_days_from_sunday())?;
                parts.set("DayOfYear", dt.ordinal())?;
                Ok(Value::Table(parts))
            })?,
        )?;
        tbl.set(
            "gettimedifference",
            lua.create_function(|_, (a, b): (i64, i64)| Ok(b.saturating_sub(a).saturating_abs()))?,
        )?;

        macro_rules! add_fn {
            ($name:literal, $unit_ms:expr) => {{
                tbl.set(
                    $name,
                    lua.create_function(|_, (ms, amount): (i64, f64)| {
                        Ok(ms.saturating_add((amount * $unit_ms as f64).round() as i64))
                    })?,
                )?;
            }};
        }
        add_fn!("addseconds", 1_000);
        add_fn!("addminutes", 60_000);
        add_fn!("addhours", 3_600_000);
        add_fn!("adddays", 86_400_000);

        tbl.set("isafter", lua.create_function(|_, (a, b): (i64, i64)| Ok(a > b))?)?;
        tbl.set("isbefore", lua.create_function(|_, (a, b): (i64, i64)| Ok(a < b))?)?;

        Ok(tbl)
    }
}

/// `min` inclusive, `max` exclusive. An empty range yields `min`.
fn random_number(min: i64, max: i64) -> i64 {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..max)
}

fn random_string(len: i64) -> String {
    let mut rng = rand::thread_rng();
    (0..len.max(0))
        .map(|_| RANDOM_CHARS[rng.gen_range(0..RANDOM_CHARS.len())] as char)
        .collect()
}

fn entries(t: &Table) -> mlua::Result<Vec<(Value, Value)>> {
    let mut out = Vec::new();
    for pair in t.clone().pairs::<Value, Value>() {
        out.push(pair?);
    }
    Ok(out)
}

/// Non-empty and every key is part of the sequence.
fn is_array(t: &Table) -> mlua::Result<bool> {
    let len = t.raw_len();
    Ok(len > 0 && entries(t)?.len() == len)
}

fn table_copy(lua: &Lua, t: &Table) -> mlua::Result<Table> {
    let copy = lua.create_table()?;
    for (k, v) in entries(t)? {
        copy.raw_set(k, v)?;
    }
    Ok(copy)
}

pub fn string_split(s: &str, delim: &str) -> Vec<String> {
    s.trim()
        .split(delim)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Empty string for an out-of-range instant or a malformed format.
pub fn format_millis(ms: i64, fmt: Option<&str>, utc: bool) -> String {
    let fmt = fmt.unwrap_or(DEFAULT_DATETIME_FORMAT);
    if StrftimeItems::new(fmt).any(|item| matches!(item, Item::Error)) {
        return String::new();
    }
    let Some(dt) = DateTime::from_timestamp_millis(ms) else {
        return String::new();
    };
    if utc {
        dt.format(fmt).to_string()
    } else {
        dt.with_timezone(&Local).format(fmt).to_string()
    }
}

/// RFC 3339, or `YYYY-MM-DD[ HH:MM:SS]` in local time.
pub fn parse_datetime(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    let naive = NaiveDateTime::parse_from_str(s, DEFAULT_DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lua() -> Lua {
        let lua = Lua::new();
        lua.globals().set("utilslib", UtilsLib.build(&lua).unwrap()).unwrap();
        lua
    }

    #[test]
    fn random_stays_in_range() {
        for _ in 0..200 {
            let n = random_number(3, 7);
            assert!((3..7).contains(&n));
        }
        assert_eq!(random_number(5, 5), 5);
        let s = random_string(16);
        assert_eq!(s.len(), 16);
        assert!(s.bytes().all(|b| RANDOM_CHARS.contains(&b)));
        assert!(random_string(-1).is_empty());
    }

    #[tokio::test]
    async fn delay_suspends_instead_of_blocking() {
        let lua = lua();
        let started = std::time::Instant::now();
        let done: bool = lua
            .load("utilslib.delay(30); return true")
            .eval_async()
            .await
            .unwrap();
        assert!(done);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(lua.load("utilslib.delay(1)").exec().is_err());
    }

    #[test]
    fn table_helpers() {
        let lua = lua();
        let (arr, map, empty, has, missing): (bool, bool, bool, bool, bool) = lua
            .load(
                r#"
                return utilslib.isluaarray({1, 2, 3}),
                    utilslib.isluaarray({a = 1}),
                    utilslib.istableempty({}),
                    utilslib.tablecontains({"x", "y"}, "y"),
                    utilslib.tablecontains({a = "x"}, "z")
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!((arr, map, empty, has, missing), (true, false, true, true, false));

        let joined: String = lua.load("return utilslib.tablejoin({'a', 'b', 'c'}, '-')").eval().unwrap();
        assert_eq!(joined, "a-b-c");
        let keyed: String = lua.load("return utilslib.tablejoin({k = 1})").eval().unwrap();
        assert_eq!(keyed, "[k]: 1");
    }

    #[test]
    fn shuffle_and_copy_leave_source_untouched() {
        let lua = lua();
        let (same_len, sum, original_first, picked): (bool, i64, i64, i64) = lua
            .load(
                r#"
                local src = {1, 2, 3, 4, 5}
                local shuffled = utilslib.tableshuffle(src)
                local copy = utilslib.tablecopy(src)
                copy[1] = 99
                local sum = 0
                for _, v in ipairs(shuffled) do sum = sum + v end
                return #shuffled == #src, sum, src[1], utilslib.tablerandom({7})
                "#,
            )
            .eval()
            .unwrap();
        assert!(same_len);
        assert_eq!(sum, 15);
        assert_eq!(original_first, 1);
        assert_eq!(picked, 7);
        let nothing: Value = lua.load("return utilslib.tablerandom({})").eval().unwrap();
        assert!(nothing.is_nil());
    }

    #[test]
    fn json_and_strings() {
        let lua = lua();
        let json: String = lua.load("return utilslib.tabletojson({name = 'bot', n = 2})").eval().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["name"], "bot");
        assert_eq!(parsed["n"], 2);

        assert_eq!(string_split("  a, b,,c  ", ","), vec!["a", "b", "c"]);
        assert!(string_split("   ", " ").is_empty());
        let formatted: String = lua
            .load("return utilslib.stringfmt('{0} owes {1}', {'alice', 5})")
            .eval()
            .unwrap();
        assert_eq!(formatted, "alice owes 5");
    }

    #[test]
    fn datetime_arithmetic() {
        let lua = lua();
        let (later, diff, after, formatted): (i64, i64, bool, String) = lua
            .load(
                r#"
                local t = 1700000000000
                local later = utilslib.addminutes(t, 1.5)
                return later, utilslib.gettimedifference(later, t), utilslib.isafter(later, t),
                    utilslib.formatdatetimeutc(t)
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(later, 1_700_000_090_000);
        assert_eq!(diff, 90_000);
        assert!(after);
        assert_eq!(formatted, "2023-11-14 22:13:20");

        assert_eq!(format_millis(0, Some("%Q"), true), "");
        assert_eq!(parse_datetime("2023-11-14T22:13:20Z"), Some(1_700_000_000_000));
        assert_eq!(parse_datetime("not a date"), None);
    }
}
