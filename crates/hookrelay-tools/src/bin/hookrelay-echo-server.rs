//! Minimal stdio tool server.
//!
//! Speaks newline-delimited JSON-RPC like any other tool server and keeps an
//! in-memory contact book, so it doubles as a local CRM stand-in.
//!
//! Environment switches:
//! - `ECHO_SERVER_REJECT_INIT=1` answers `initialize` with an error
//! - `ECHO_SERVER_SILENT_INIT=1` never answers `initialize`

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Default)]
struct ContactBook {
    next_id: u64,
    by_phone: HashMap<String, Value>,
}

impl ContactBook {
    fn find(&self, phone: &str) -> Option<&Value> {
        self.by_phone.get(phone)
    }

    fn create(&mut self, mut contact: Value) -> Value {
        self.next_id += 1;
        let id = format!("contact-{}", self.next_id);
        contact["id"] = json!(id);
        let phone = contact
            .get("phone")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        self.by_phone.insert(phone, contact.clone());
        contact
    }

    fn update(&mut self, id: &str, data: &Value) -> Option<Value> {
        let contact = self
            .by_phone
            .values_mut()
            .find(|contact| contact.get("id").and_then(Value::as_str) == Some(id))?;
        if let (Some(target), Some(fields)) = (contact.as_object_mut(), data.as_object()) {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
        Some(contact.clone())
    }
}

enum Reply {
    Result(Value),
    Error(i64, String),
    Exit,
}

fn flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|value| value == "1")
}

fn text(value: impl Into<String>) -> Value {
    json!({ "content": [{ "type": "text", "text": value.into() }] })
}

fn tool_list() -> Value {
    json!({
        "tools": [
            {
                "name": "echo",
                "description": "Return the arguments unchanged",
                "inputSchema": { "type": "object" }
            },
            {
                "name": "fail",
                "description": "Always report a tool error",
                "inputSchema": { "type": "object" }
            },
            {
                "name": "sleep",
                "description": "Answer after `ms` milliseconds",
                "inputSchema": { "type": "object", "properties": { "ms": { "type": "integer" } } }
            },
            {
                "name": "exit",
                "description": "Terminate the server without answering",
                "inputSchema": { "type": "object" }
            },
            {
                "name": "get_contact_by_phone",
                "description": "Look up a contact by phone number",
                "inputSchema": { "type": "object", "properties": { "phone": { "type": "string" } }, "required": ["phone"] }
            },
            {
                "name": "create_contact",
                "description": "Create a contact",
                "inputSchema": { "type": "object", "properties": { "phone": { "type": "string" } }, "required": ["phone"] }
            },
            {
                "name": "update_contact",
                "description": "Merge fields into an existing contact",
                "inputSchema": { "type": "object", "properties": { "id": { "type": "string" }, "data": { "type": "object" } }, "required": ["id", "data"] }
            }
        ]
    })
}

async fn call_tool(contacts: &mut ContactBook, params: &Value) -> Reply {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match name {
        "echo" => Reply::Result(json!({
            "content": [{ "type": "text", "text": arguments.to_string() }],
            "structuredContent": arguments,
        })),
        "fail" => {
            let mut result = text("requested failure");
            result["isError"] = json!(true);
            Reply::Result(result)
        }
        "sleep" => {
            let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Reply::Result(text(format!("slept {ms}ms")))
        }
        "exit" => Reply::Exit,
        "get_contact_by_phone" => {
            let phone = arguments.get("phone").and_then(Value::as_str).unwrap_or_default();
            match contacts.find(phone) {
                Some(contact) => Reply::Result(json!({
                    "content": [{ "type": "text", "text": contact.to_string() }],
                    "structuredContent": contact,
                })),
                None => Reply::Result(json!({ "content": [] })),
            }
        }
        "create_contact" => {
            let contact = contacts.create(arguments);
            Reply::Result(json!({
                "content": [{ "type": "text", "text": contact.to_string() }],
                "structuredContent": contact,
            }))
        }
        "update_contact" => {
            let id = arguments.get("id").and_then(Value::as_str).unwrap_or_default();
            let data = arguments.get("data").cloned().unwrap_or_else(|| json!({}));
            match contacts.update(id, &data) {
                Some(contact) => Reply::Result(json!({
                    "content": [{ "type": "text", "text": contact.to_string() }],
                    "structuredContent": contact,
                })),
                None => {
                    let mut result = text(format!("contact not found: {id}"));
                    result["isError"] = json!(true);
                    Reply::Result(result)
                }
            }
        }
        other => Reply::Error(-32602, format!("unknown tool: {other}")),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let reject_init = flag("ECHO_SERVER_REJECT_INIT");
    let silent_init = flag("ECHO_SERVER_SILENT_INIT");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut contacts = ContactBook::default();

    while let Some(line) = lines.next_line().await? {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let Some(id) = request.get("id").cloned() else {
            // notification
            continue;
        };
        let method = request.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        let reply = match method {
            "initialize" if silent_init => continue,
            "initialize" if reject_init => Reply::Error(-32000, "initialization refused".to_owned()),
            "initialize" => Reply::Result(json!({
                "protocolVersion": params.get("protocolVersion").cloned().unwrap_or(json!("2024-11-05")),
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "hookrelay-echo-server", "version": env!("CARGO_PKG_VERSION") },
            })),
            "tools/list" => Reply::Result(tool_list()),
            "tools/call" => call_tool(&mut contacts, &params).await,
            "ping" => Reply::Result(json!({})),
            other => Reply::Error(-32601, format!("method not found: {other}")),
        };

        let response = match reply {
            Reply::Result(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Reply::Error(code, message) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message },
            }),
            Reply::Exit => break,
        };
        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
        stdout.flush().await?;
    }

    Ok(())
}
