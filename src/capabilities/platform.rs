/// `capabilities/platform.rs` — `twitchlib`, chat platform queries
use std::sync::Arc;

use async_trait::async_trait;
use mlua::{Lua, Table};

use crate::error::{HubError, HubResult};

use super::Capability;

#[async_trait]
pub trait PlatformQuery: Send + Sync {
    async fn is_connected(&self) -> bool;
    async fn send_message(&self, message: &str) -> HubResult<()>;
    async fn get_user_id(&self, login: &str) -> HubResult<String>;
    async fn get_username(&self, user_id: &str) -> HubResult<String>;
    async fn is_broadcaster(&self, user_id: &str) -> HubResult<bool>;
    async fn is_moderator(&self, user_id: &str) -> HubResult<bool>;
    async fn is_vip(&self, user_id: &str) -> HubResult<bool>;
    async fn is_follower(&self, user_id: &str) -> HubResult<bool>;
    /// Unix milliseconds of the follow, or -1 when `user_id` does not follow.
    async fn follow_date(&self, user_id: &str) -> HubResult<i64>;
}

/// Used when no chat client is configured: reports disconnected and refuses
/// to send.
pub struct OfflinePlatform;

#[async_trait]
impl PlatformQuery for OfflinePlatform {
    async fn is_connected(&self) -> bool {
        false
    }

    async fn send_message(&self, _message: &str) -> HubResult<()> {
        Err(HubError::Capability(
            "unable to send message, chat client is not connected".into(),
        ))
    }

    async fn get_user_id(&self, login: &str) -> HubResult<String> {
        Err(HubError::Capability(format!("user not found: {login}")))
    }

    async fn get_username(&self, user_id: &str) -> HubResult<String> {
        Err(HubError::Capability(format!("user not found (id): {user_id}")))
    }

    async fn is_broadcaster(&self, _user_id: &str) -> HubResult<bool> {
        Ok(false)
    }

    async fn is_moderator(&self, _user_id: &str) -> HubResult<bool> {
        Ok(false)
    }

    async fn is_vip(&self, _user_id: &str) -> HubResult<bool> {
        Ok(false)
    }

    async fn is_follower(&self, _user_id: &str) -> HubResult<bool> {
        Ok(false)
    }

    async fn follow_date(&self, _user_id: &str) -> HubResult<i64> {
        Ok(-1)
    }
}

pub struct TwitchLib {
    platform: Arc<dyn PlatformQuery>,
}

impl TwitchLib {
    pub fn new(platform: Arc<dyn PlatformQuery>) -> Self {
        Self { platform }
    }
}

impl Capability for TwitchLib {
    fn name(&self) -> &'static str {
        "twitchlib"
    }

    fn build(&self, lua: &Lua) -> mlua::Result<Table> {
        let tbl = lua.create_table()?;

        // one string argument -> HubResult<T>
        macro_rules! query_fn {
            ($name:literal, $method:ident) => {{
                let platform = Arc::clone(&self.platform);
                tbl.set(
                    $name,
                    lua.create_async_function(move |_, arg: String| {
                        let platform = Arc::clone(&platform);
                        async move { platform.$method(&arg).await.map_err(HubError::into_lua) }
                    })?,
                )?;
            }};
        }

        let platform = Arc::clone(&self.platform);
        tbl.set(
            "isconnected",
            lua.create_async_function(move |_, ()| {
                let platform = Arc::clone(&platform);
                async move { Ok(platform.is_connected().await) }
            })?,
        )?;
        query_fn!("sendmessage", send_message);
        query_fn!("getuserid", get_user_id);
        query_fn!("getusername", get_username);
        query_fn!("isbroadcaster", is_broadcaster);
        query_fn!("ismoderator", is_moderator);
        query_fn!("isvip", is_vip);
        query_fn!("isfollower", is_follower);
        query_fn!("getfollowdate", follow_date);

        Ok(tbl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeChannel;

    #[async_trait]
    impl PlatformQuery for FakeChannel {
        async fn is_connected(&self) -> bool {
            true
        }
        async fn send_message(&self, _message: &str) -> HubResult<()> {
            Ok(())
        }
        async fn get_user_id(&self, login: &str) -> HubResult<String> {
            Ok(format!("id-{login}"))
        }
        async fn get_username(&self, user_id: &str) -> HubResult<String> {
            Ok(user_id.trim_start_matches("id-").to_string())
        }
        async fn is_broadcaster(&self, user_id: &str) -> HubResult<bool> {
            Ok(user_id == "id-owner")
        }
        async fn is_moderator(&self, _user_id: &str) -> HubResult<bool> {
            Ok(true)
        }
        async fn is_vip(&self, _user_id: &str) -> HubResult<bool> {
            Ok(false)
        }
        async fn is_follower(&self, user_id: &str) -> HubResult<bool> {
            Ok(user_id == "id-alice")
        }
        async fn follow_date(&self, user_id: &str) -> HubResult<i64> {
            Ok(if user_id == "id-alice" { 1_700_000_000_000 } else { -1 })
        }
    }

    fn lua_with(platform: Arc<dyn PlatformQuery>) -> Lua {
        let lua = Lua::new();
        let lib = TwitchLib::new(platform);
        lua.globals().set("twitchlib", lib.build(&lua).unwrap()).unwrap();
        lua
    }

    #[tokio::test]
    async fn offline_reports_disconnected_and_refuses_to_send() {
        let lua = lua_with(Arc::new(OfflinePlatform));

        let (connected, date): (bool, i64) = lua
            .load("return twitchlib.isconnected(), twitchlib.getfollowdate('42')")
            .eval_async()
            .await
            .unwrap();
        assert!(!connected);
        assert_eq!(date, -1);

        let err = lua
            .load("twitchlib.sendmessage('hi')")
            .exec_async()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }

    #[tokio::test]
    async fn queries_go_through_the_platform() {
        let lua = lua_with(Arc::new(FakeChannel));

        let (id, name, follower, date, owner): (String, String, bool, i64, bool) = lua
            .load(
                r#"
                local id = twitchlib.getuserid("alice")
                return id, twitchlib.getusername(id), twitchlib.isfollower(id),
                    twitchlib.getfollowdate(id), twitchlib.isbroadcaster(id)
                "#,
            )
            .eval_async()
            .await
            .unwrap();
        assert_eq!(id, "id-alice");
        assert_eq!(name, "alice");
        assert!(follower);
        assert_eq!(date, 1_700_000_000_000);
        assert!(!owner);
    }
}
