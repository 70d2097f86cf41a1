//! Scripted quota source and fixtures shared by unit tests

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use cloudcode_auth::{Account, AccountStorage};

use crate::error::{Error, Result};
use crate::probe::{ModelQuota, QuotaSnapshot, QuotaSource};
use crate::rotator::{AccountRotator, DEFAULT_COOLDOWN};
use crate::table::QuotaRecord;

/// Project id handed out to accounts that have none.
pub(crate) const SCRIPTED_PROJECT: &str = "scripted-project";

#[derive(Clone)]
pub(crate) enum Reply {
    Models(Vec<(String, String, f64, Option<String>)>),
    AuthFailure,
    Transient,
}

/// Model entry whose label equals its id.
pub(crate) fn model(id: &str, fraction: f64) -> (String, String, f64, Option<String>) {
    (id.to_string(), id.to_string(), fraction, None)
}

/// Replies keyed by refresh token. Unknown tokens get an empty model list.
#[derive(Default)]
pub(crate) struct ScriptedSource {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSource {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set(&self, token: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(token.to_string(), reply);
    }

    /// Refresh tokens probed so far, in order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl QuotaSource for ScriptedSource {
    fn fetch_all<'a>(
        &'a self,
        account: &'a Account,
    ) -> Pin<Box<dyn Future<Output = Result<QuotaSnapshot>> + Send + 'a>> {
        let token = account.refresh_token.expose().clone();
        self.calls.lock().unwrap().push(token.clone());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&token)
            .cloned()
            .unwrap_or(Reply::Models(Vec::new()));

        let result = match reply {
            Reply::Models(specs) => {
                let models = specs
                    .into_iter()
                    .map(|(id, label, fraction, reset)| ModelQuota {
                        record: Arc::new(QuotaRecord::new(id.clone(), fraction).with_reset_time(reset)),
                        id,
                        label,
                    })
                    .collect();
                let project = account
                    .project()
                    .map(str::to_string)
                    .or_else(|| Some(SCRIPTED_PROJECT.to_string()));
                Ok(QuotaSnapshot::new(models, project))
            }
            Reply::AuthFailure => Err(Error::Authentication(format!("{token} revoked"))),
            Reply::Transient => Err(Error::Transient("connection reset".into())),
        };
        Box::pin(std::future::ready(result))
    }
}

pub(crate) fn accounts(tokens: &[&str]) -> Vec<Account> {
    tokens.iter().map(|t| Account::new(*t)).collect()
}

pub(crate) fn rotator(tokens: &[&str]) -> Arc<AccountRotator> {
    Arc::new(AccountRotator::new(
        AccountStorage::new(accounts(tokens), 0),
        None,
        DEFAULT_COOLDOWN,
    ))
}
