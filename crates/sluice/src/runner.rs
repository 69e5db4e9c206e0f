//! Runs a skill end to end: bindings in, classified response out.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::bindings::Bindings;
use crate::error::{ClassifiedFailure, Exception};
use crate::policy::Policy;
use crate::value::{Namespace, Value};

/// Name of the result callback skills must call.
pub const REPLY_CALLBACK: &str = "bot.reply";

/// One message a skill sent back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    /// Message text.
    pub text: String,
    /// Whether the message goes privately to the caller.
    pub direct_message: bool,
}

/// Collects what a skill sends through `bot.reply`.
///
/// The `bot` namespace handed to a skill has:
/// - `bot.reply(message, direct_message=False)`, which records a reply;
/// - `bot.outputs`, a dict the skill may fill with structured results;
/// - `bot.args`, the skill's arguments (also bound as `args`).
#[derive(Clone, Debug, Default)]
pub struct ReplySink {
    replies: Arc<Mutex<Vec<Reply>>>,
}

impl ReplySink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replies recorded so far.
    pub fn replies(&self) -> Vec<Reply> {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The `bot` namespace, with `args` exposed as `bot.args`.
    pub fn bot(&self, args: Value) -> Namespace {
        let sink = self.clone();
        Namespace::new("bot")
            .with("reply", Value::function("reply", move |args, kwargs| sink.reply(args, kwargs)))
            .with("outputs", Value::Dict(Vec::new()))
            .with("args", args)
    }

    fn reply(&self, args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, Exception> {
        let mut message = args.first();
        let mut direct_message = args.get(1);
        if args.len() > 2 {
            return Err(Exception::type_error(format!(
                "reply() takes at most 2 arguments ({} given)",
                args.len()
            )));
        }
        for (name, value) in kwargs {
            let slot = match name.as_str() {
                "message" => &mut message,
                "direct_message" => &mut direct_message,
                _ => {
                    return Err(Exception::type_error(format!(
                        "reply() got an unexpected keyword argument '{name}'"
                    )));
                }
            };
            if slot.replace(value).is_some() {
                return Err(Exception::type_error(format!(
                    "reply() got multiple values for argument '{name}'"
                )));
            }
        }
        let text = message
            .map(Value::to_string)
            .ok_or_else(|| Exception::type_error("reply() missing required argument 'message'"))?;
        let direct_message = direct_message.is_some_and(Value::truthy);
        tracing::debug!(len = text.len(), direct_message, "skill replied");
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Reply {
                text,
                direct_message,
            });
        Ok(Value::None)
    }
}

/// The outcome of one skill run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillRunResponse {
    /// No failures were recorded.
    pub success: bool,
    /// Classified failures, in the order they happened.
    pub errors: Vec<ClassifiedFailure>,
    /// Replies the skill sent.
    pub replies: Vec<Reply>,
    /// The skill's `bot.outputs`, as JSON.
    pub outputs: serde_json::Value,
}

/// Runs skills under one policy.
///
/// The policy is shared configuration; every [`run`](Self::run) builds its
/// own bindings and sink.
#[derive(Clone, Debug)]
pub struct SkillRunner {
    policy: Policy,
}

impl SkillRunner {
    /// A runner using `policy`.
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }

    /// The policy skills run under.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Run `code` with `args` bound as `args` and `bot.args`.
    pub fn run(&self, code: &str, args: &serde_json::Value) -> SkillRunResponse {
        let policy_name = self.policy.name();
        tracing::info!(policy = policy_name, "Running user script under {policy_name} policy");

        let sink = ReplySink::new();
        let mut bindings = Bindings::new();
        bindings.insert("bot", sink.bot(Value::from_json(args)));
        bindings.insert("args", Value::from_json(args));

        let mut errors = Vec::new();
        match self.policy.exec(code, &mut bindings) {
            Ok(()) => {
                if sink.replies().is_empty() {
                    errors.push(ClassifiedFailure::no_response(REPLY_CALLBACK));
                }
            }
            Err(e) => {
                tracing::debug!(kind = e.kind(), "skill failed");
                errors.push(ClassifiedFailure::from(&e));
            }
        }

        let outputs = bindings
            .get("bot")
            .and_then(|bot| bot.get("outputs"))
            .cloned()
            .unwrap_or(Value::Dict(Vec::new()));
        let outputs = match outputs.to_json() {
            Ok(json) => json,
            Err(e) => {
                errors.push(ClassifiedFailure::from(&e));
                serde_json::Value::Object(serde_json::Map::new())
            }
        };

        SkillRunResponse {
            success: errors.is_empty(),
            errors,
            replies: sink.replies(),
            outputs,
        }
    }
}
