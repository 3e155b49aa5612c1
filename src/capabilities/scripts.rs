/// `capabilities/scripts.rs` — `scriptlib`, lets reactions run catalog scripts
use mlua::{Lua, Table, Value};

use crate::scripting::catalog::ScriptCatalog;

use super::Capability;

pub struct ScriptLib {
    catalog: ScriptCatalog,
}

impl ScriptLib {
    pub fn new(catalog: ScriptCatalog) -> Self {
        Self { catalog }
    }
}

impl Capability for ScriptLib {
    fn name(&self) -> &'static str {
        "scriptlib"
    }

    fn build(&self, lua: &Lua) -> mlua::Result<Table> {
        let tbl = lua.create_table()?;

        let catalog = self.catalog.clone();
        tbl.set(
            "keys",
            lua.create_function(move |lua, ()| lua.create_sequence_from(catalog.keys()))?,
        )?;
        let catalog = self.catalog.clone();
        tbl.set(
            "contains",
            lua.create_function(move |_, name: String| Ok(catalog.contains(&name)))?,
        )?;
        let catalog = self.catalog.clone();
        tbl.set(
            "remove",
            lua.create_function(move |_, name: String| Ok(catalog.remove_named(&name)))?,
        )?;
        // -> success, result, error message
        let catalog = self.catalog.clone();
        tbl.set(
            "call",
            lua.create_async_function(move |_, name: String| {
                let catalog = catalog.clone();
                async move {
                    let res = catalog.call(&name).await;
                    let success = res.success();
                    let result: Value = res.result.into_inner();
                    Ok((success, result, res.error_message))
                }
            })?,
        )?;

        Ok(tbl)
    }
}
