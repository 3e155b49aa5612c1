/// `capabilities/logger.rs` — `loggerlib`
///
/// Forwards to the host's `log` facade under the `script` target, so script
/// output is filtered with `RUST_LOG=script=debug` like any other module.
use log::Level;
use mlua::{Lua, Table, Value};

use crate::scripting::value::ScriptValue;

use super::Capability;

pub struct LoggerLib;

impl Capability for LoggerLib {
    fn name(&self) -> &'static str {
        "loggerlib"
    }

    fn build(&self, lua: &Lua) -> mlua::Result<Table> {
        let tbl = lua.create_table()?;

        macro_rules! log_fn {
            ($name:literal, $level:expr) => {{
                tbl.set(
                    $name,
                    lua.create_function(|_, msg: Value| {
                        log::log!(target: "script", $level, "{}", ScriptValue::from(msg));
                        Ok(())
                    })?,
                )?;
            }};
        }
        macro_rules! log_fmt_fn {
            ($name:literal, $level:expr) => {{
                tbl.set(
                    $name,
                    lua.create_function(|_, (template, args): (String, Option<Table>)| {
                        let args = args.map(table_args).transpose()?.unwrap_or_default();
                        log::log!(target: "script", $level, "{}", format_template(&template, &args));
                        Ok(())
                    })?,
                )?;
            }};
        }

        log_fn!("loginfo", Level::Info);
        log_fn!("logdebug", Level::Debug);
        log_fn!("logwarning", Level::Warn);
        log_fn!("logerror", Level::Error);
        log_fmt_fn!("loginfofmt", Level::Info);
        log_fmt_fn!("logdebugfmt", Level::Debug);
        log_fmt_fn!("logwarningfmt", Level::Warn);
        log_fmt_fn!("logerrorfmt", Level::Error);
        Ok(tbl)
    }
}

/// Array part first, in order; then any remaining keyed values.
pub(crate) fn table_args(table: Table) -> mlua::Result<Vec<String>> {
    let mut out = Vec::new();
    let len = table.raw_len();
    for i in 1..=len {
        out.push(ScriptValue::from(table.raw_get::<Value>(i)?).to_string());
    }
    for pair in table.pairs::<Value, Value>() {
        let (k, v) = pair?;
        if matches!(k, Value::Integer(i) if i >= 1 && (i as usize) <= len) {
            continue;
        }
        out.push(ScriptValue::from(v).to_string());
    }
    Ok(out)
}

/// Replace `{}` / `{Name}` placeholders left to right with `args`. Extra
/// placeholders are left as written.
pub fn format_template(template: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}').map(|c| open + c) else {
            break;
        };
        let inner = &rest[open + 1..close];
        out.push_str(&rest[..open]);
        if inner.chars().all(|c| c.is_alphanumeric() || c == '_') {
            match args.next() {
                Some(arg) => out.push_str(arg),
                None => out.push_str(&rest[open..=close]),
            }
        } else {
            out.push_str(&rest[open..=close]);
        }
        rest = &rest[close + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_fill_in_order() {
        let args = vec!["alice".to_string(), "42".to_string()];
        assert_eq!(format_template("{User} has {} points", &args), "alice has 42 points");
    }

    #[test]
    fn missing_args_leave_placeholder() {
        assert_eq!(format_template("{a} and {b}", &["x".into()]), "x and {b}");
        assert_eq!(format_template("no braces", &[]), "no braces");
        assert_eq!(format_template("open { only", &["x".into()]), "open { only");
    }

    #[test]
    fn binding_accepts_any_value() {
        let lua = Lua::new();
        lua.globals().set("loggerlib", LoggerLib.build(&lua).unwrap()).unwrap();
        lua.load(
            r#"
            loggerlib.loginfo("hello")
            loggerlib.logwarning(42)
            loggerlib.logerrorfmt("{Who} failed {}", {"alice", 3})
            loggerlib.logdebugfmt("nothing")
            "#,
        )
        .exec()
        .unwrap();
    }

    #[test]
    fn table_args_keeps_array_order() {
        let lua = Lua::new();
        let t: Table = lua.load("return {'a', 'b', 3}").eval().unwrap();
        assert_eq!(table_args(t).unwrap(), vec!["a", "b", "3"]);
    }
}
