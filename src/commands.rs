//! Remote-invocable commands
//!
//! The model may ask the application to perform a named side effect (a
//! "tool call"). Commands are declared to the service at setup through
//! their [`CommandSpec`], handled locally by a registered
//! [`CommandHandler`], and every call is acknowledged exactly once.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::Voice;
use crate::gemini::FunctionResponse;

/// A request from the model to run a command.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Parameter types understood by the function-declaration schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Number,
    Boolean,
}

impl ParamKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::String => "STRING",
            Self::Number => "NUMBER",
            Self::Boolean => "BOOLEAN",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    pub allowed: Vec<String>,
    pub required: bool,
}

impl ParameterSpec {
    pub fn new(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            allowed: Vec::new(),
            required: true,
        }
    }

    pub fn one_of<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Declaration of a command the model may call.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
}

impl CommandSpec {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: Vec::new(),
        }
    }

    pub fn param(mut self, param: ParameterSpec) -> Self {
        self.parameters.push(param);
        self
    }

    /// Function declaration as sent in the setup message.
    pub fn function_declaration(&self) -> Value {
        let mut properties = serde_json::Map::new();
        for p in &self.parameters {
            let mut schema = json!({
                "type": p.kind.as_str(),
                "description": p.description,
            });
            if !p.allowed.is_empty() {
                schema["enum"] = json!(p.allowed);
            }
            properties.insert(p.name.clone(), schema);
        }

        let mut declaration = json!({
            "name": self.name,
            "description": self.description,
        });
        if !self.parameters.is_empty() {
            let required: Vec<&str> = self
                .parameters
                .iter()
                .filter(|p| p.required)
                .map(|p| p.name.as_str())
                .collect();
            declaration["parameters"] = json!({
                "type": "OBJECT",
                "properties": properties,
                "required": required,
            });
        }
        declaration
    }

    /// Check that every required argument is present.
    fn validate(&self, args: &Value) -> Result<(), String> {
        for p in self.parameters.iter().filter(|p| p.required) {
            match args.get(&p.name) {
                Some(v) if !v.is_null() => {}
                _ => return Err(format!("missing argument '{}'", p.name)),
            }
        }
        Ok(())
    }
}

/// Built-in command letting the model switch the synthesized voice.
pub fn change_voice() -> CommandSpec {
    CommandSpec::new(
        "change_voice",
        "Change the voice used to speak to the user. Takes effect when the session restarts.",
    )
    .param(
        ParameterSpec::new("voice_name", ParamKind::String, "Name of the new voice")
            .one_of(Voice::ALL.iter().map(|v| v.as_str())),
    )
}

/// Local side effect behind a command.
pub trait CommandHandler: Send + Sync {
    fn invoke(&self, args: &Value) -> Result<Value, String>;
}

impl<F> CommandHandler for F
where
    F: Fn(&Value) -> Result<Value, String> + Send + Sync,
{
    fn invoke(&self, args: &Value) -> Result<Value, String> {
        self(args)
    }
}

/// Handlers by command name.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, name: &str, handler: H)
    where
        H: CommandHandler + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }
}

/// What happened to one tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Declared and handled successfully
    Handled,
    /// Declared, but the handler failed or the arguments were invalid
    Failed(String),
    /// Not among the declared commands
    Unknown,
}

/// Result of dispatching one call: the acknowledgement to send back plus
/// what the caller should be told.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub request: ToolCallRequest,
    pub ack: FunctionResponse,
    pub outcome: DispatchOutcome,
}

/// Routes tool calls for one session.
pub struct CommandDispatcher {
    declared: HashMap<String, CommandSpec>,
    registry: Arc<CommandRegistry>,
}

impl CommandDispatcher {
    pub fn new(declared: &[CommandSpec], registry: Arc<CommandRegistry>) -> Self {
        Self {
            declared: declared
                .iter()
                .map(|c| (c.name.clone(), c.clone()))
                .collect(),
            registry,
        }
    }

    /// Run the handler for `request` and build its acknowledgement.
    ///
    /// Always produces an acknowledgement so the remote side never stalls.
    pub fn on_tool_call(&self, request: ToolCallRequest) -> Dispatch {
        info!("Tool call {} ({})", request.name, request.id);
        let (outcome, response) = match self.declared.get(&request.name) {
            None => {
                warn!("Unknown command requested: {}", request.name);
                (
                    DispatchOutcome::Unknown,
                    json!({"error": format!("unknown command '{}'", request.name)}),
                )
            }
            Some(spec) => match self.run(spec, &request.args) {
                Ok(result) => (DispatchOutcome::Handled, json!({"result": result})),
                Err(e) => {
                    warn!("Command {} failed: {}", request.name, e);
                    (DispatchOutcome::Failed(e.clone()), json!({"error": e}))
                }
            },
        };

        debug!("Acknowledging tool call {}", request.id);
        Dispatch {
            ack: FunctionResponse {
                id: request.id.clone(),
                name: request.name.clone(),
                response,
            },
            request,
            outcome,
        }
    }

    fn run(&self, spec: &CommandSpec, args: &Value) -> Result<Value, String> {
        spec.validate(args)?;
        match self.registry.get(&spec.name) {
            Some(handler) => handler.invoke(args),
            // Declared but handled by the caller through the command event.
            None => Ok(json!("ok")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn request(id: &str, name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            args,
        }
    }

    #[test]
    fn test_change_voice_declaration() {
        let decl = change_voice().function_declaration();
        assert_eq!(decl["name"], "change_voice");
        assert_eq!(decl["parameters"]["type"], "OBJECT");
        assert_eq!(decl["parameters"]["properties"]["voice_name"]["type"], "STRING");
        assert_eq!(decl["parameters"]["properties"]["voice_name"]["enum"][2], "Kore");
        assert_eq!(decl["parameters"]["required"][0], "voice_name");
    }

    #[test]
    fn test_declaration_without_parameters() {
        let decl = CommandSpec::new("stop", "Stop talking").function_declaration();
        assert!(decl.get("parameters").is_none());
    }

    #[test]
    fn test_handled_command_invokes_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let mut registry = CommandRegistry::new();
        registry.register("change_voice", move |args: &Value| -> Result<Value, String> {
            seen_clone.lock().unwrap().push(args.clone());
            Ok(json!("voice changed"))
        });

        let dispatcher = CommandDispatcher::new(&[change_voice()], Arc::new(registry));
        let dispatch = dispatcher.on_tool_call(request("1", "change_voice", json!({"voice_name": "Kore"})));

        assert_eq!(dispatch.outcome, DispatchOutcome::Handled);
        assert_eq!(dispatch.ack.id, "1");
        assert_eq!(dispatch.ack.response["result"], "voice changed");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_failing_handler_is_still_acknowledged() {
        let mut registry = CommandRegistry::new();
        registry.register("change_voice", |_: &Value| -> Result<Value, String> {
            Err("speaker busy".to_string())
        });

        let dispatcher = CommandDispatcher::new(&[change_voice()], Arc::new(registry));
        let dispatch = dispatcher.on_tool_call(request("7", "change_voice", json!({"voice_name": "Puck"})));

        assert_eq!(dispatch.outcome, DispatchOutcome::Failed("speaker busy".to_string()));
        assert_eq!(dispatch.ack.id, "7");
        assert_eq!(dispatch.ack.response["error"], "speaker busy");
    }

    #[test]
    fn test_missing_argument_fails_without_calling_handler() {
        let mut registry = CommandRegistry::new();
        registry.register("change_voice", |_: &Value| -> Result<Value, String> {
            panic!("handler must not run")
        });

        let dispatcher = CommandDispatcher::new(&[change_voice()], Arc::new(registry));
        let dispatch = dispatcher.on_tool_call(request("2", "change_voice", json!({})));
        assert_eq!(
            dispatch.outcome,
            DispatchOutcome::Failed("missing argument 'voice_name'".to_string())
        );
    }

    #[test]
    fn test_unknown_command_is_acknowledged() {
        let dispatcher = CommandDispatcher::new(&[change_voice()], Arc::new(CommandRegistry::new()));
        let dispatch = dispatcher.on_tool_call(request("3", "launch_rocket", Value::Null));
        assert_eq!(dispatch.outcome, DispatchOutcome::Unknown);
        assert_eq!(dispatch.ack.id, "3");
        assert_eq!(dispatch.ack.name, "launch_rocket");
        assert!(dispatch.ack.response["error"]
            .as_str()
            .unwrap()
            .contains("launch_rocket"));
    }

    #[test]
    fn test_registered_but_undeclared_is_unknown() {
        let mut registry = CommandRegistry::new();
        registry.register("change_voice", |_: &Value| -> Result<Value, String> { Ok(Value::Null) });
        let dispatcher = CommandDispatcher::new(&[], Arc::new(registry));
        let dispatch = dispatcher.on_tool_call(request("4", "change_voice", json!({"voice_name": "Puck"})));
        assert_eq!(dispatch.outcome, DispatchOutcome::Unknown);
    }
}
