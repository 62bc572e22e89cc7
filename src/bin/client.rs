// FlowForge interactive client
// Run with: cargo run --bin client -- --server http://localhost:8080

//! Line-oriented frontend for the FlowForge backend. Commands are terminated
//! by `;`, may span multiple lines, `//`-prefixed lines are comments, and
//! `!!` repeats the last command. `redirect <file>` replays a command file.
//!
//! Commands: `login <name>`, `logout`, `store`, `view <table>`,
//! `view pattern <re>`, `view limit <n>`, `view reset`,
//! `view data_of|log_of <referer>`, `cat <referer>`, `export <json>`,
//! `user|data|node|workflow|refine|run <json>`, `redirect <file>`,
//! `exit`/`quit`.

use std::io::{BufRead, Write};

use clap::Parser;
use colored::Colorize;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "flowforge-client")]
#[command(about = "FlowForge interactive client")]
struct Cli {
    /// Backend base URL
    #[arg(long, default_value = "http://localhost:8080")]
    server: String,
}

struct Client {
    http: reqwest::blocking::Client,
    base_url: String,
    token: Option<String>,
    pattern: Option<String>,
    limit: Option<String>,
    last_command: Option<String>,
    errors: u32,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut client = Client {
        http: reqwest::blocking::Client::new(),
        base_url: cli.server.trim_end_matches('/').to_string(),
        token: None,
        pattern: None,
        limit: None,
        last_command: None,
        errors: 0,
    };

    let stdin = std::io::stdin();
    let mut buffer = String::new();
    print_prompt();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.starts_with("//") {
            print_prompt();
            continue;
        }
        if let Some(head) = line.strip_suffix(';') {
            buffer.push_str(head);
            let command = buffer.trim().to_string();
            buffer.clear();
            if !run_command(&mut client, &command, false) {
                break;
            }
            print_prompt();
        } else {
            buffer.push_str(line);
            buffer.push(' ');
        }
    }
    Ok(())
}

fn print_prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// Execute one command. Returns false when the session should end.
fn run_command(client: &mut Client, input: &str, echo: bool) -> bool {
    if echo {
        println!("{} {input}", ">>".dimmed());
    }
    let input = if input == "!!" {
        match client.last_command.clone() {
            Some(last) => last,
            None => return true,
        }
    } else {
        let owned = input.to_string();
        client.last_command = Some(owned.clone());
        owned
    };

    match dispatch_command(client, &input) {
        Ok(keep_running) => keep_running,
        Err(error) => {
            client.errors += 1;
            println!("{} {error}", "ERROR:".red().bold());
            true
        }
    }
}

fn dispatch_command(client: &mut Client, input: &str) -> anyhow::Result<bool> {
    let (cmd, rest) = split_on_first_whitespace(input);
    match cmd {
        "" => {}
        "exit" | "quit" => return Ok(false),
        "login" => {
            let body = client.post("login", json!({ "name": rest }), false)?;
            client.token = body["hash"].as_str().map(str::to_string);
            println!("{}", "OK".green());
        }
        "logout" => {
            client.token = None;
            println!("{}", "OK".green());
        }
        "store" => {
            client.post("store", json!({}), true)?;
            println!("{}", "OK".green());
        }
        "errors" => {
            println!("errors so far: {}", client.errors);
            client.errors = 0;
        }
        "view" | "show" => {
            let (sub, view_rest) = split_on_first_whitespace(rest);
            match sub {
                "pattern" => client.pattern = Some(view_rest.to_string()),
                "limit" => client.limit = Some(view_rest.to_string()),
                "reset" => {
                    client.pattern = None;
                    client.limit = None;
                }
                "data_of" | "do" => {
                    let body =
                        client.post("view/data_of", referer_from_input(view_rest)?, true)?;
                    print_name_version_hash(&body);
                    print_table(&body["table"]);
                }
                "log_of" | "lo" => {
                    let body = client.post("view/log_of", referer_from_input(view_rest)?, true)?;
                    print_name_version_hash(&body);
                    println!("----------------------------------------");
                    for line in body["log"].as_array().into_iter().flatten() {
                        println!("{}", line.as_str().unwrap_or_default());
                    }
                    println!("----------------------------------------");
                }
                "user" | "data" | "node" | "workflow" | "run" => {
                    let body = client.post(
                        "view/table",
                        json!({
                            "name": sub,
                            "pattern": client.pattern.clone(),
                            "limit": client.limit.clone()
                        }),
                        true,
                    )?;
                    print_table(&body["table"]);
                }
                _ => anyhow::bail!("invalid view command: {sub}"),
            }
        }
        "cat" => {
            let body = client.post("get_data", referer_from_input(rest)?, true)?;
            println!(
                "name: {} version: {} hash: {}",
                body["name"].as_str().unwrap_or_default(),
                body["version"],
                body["hash"].as_str().unwrap_or_default()
            );
            println!("{}", body["content"].as_str().unwrap_or_default());
        }
        "export" => {
            client.post("export", serde_json::from_str(rest)?, true)?;
            println!("{}", "OK".green());
        }
        "user" | "data" | "node" | "workflow" | "refine" => {
            let body = client.post(cmd, serde_json::from_str(rest)?, true)?;
            println!("{} {}", "OK".green(), body["hash"].as_str().unwrap_or_default());
        }
        "run" => {
            let body = client.post("run", serde_json::from_str(rest)?, true)?;
            let run_hash = body["hash"].as_str().unwrap_or_default().to_string();
            println!("{} {run_hash}", "OK".green());
            // show what the run produced
            let data_of = client.post("view/data_of", json!({ "hash": run_hash }), true)?;
            print_table(&data_of["table"]);
        }
        "redirect" => {
            redirect(client, rest)?;
        }
        _ => anyhow::bail!("invalid command: {cmd}"),
    }
    Ok(true)
}

/// Replay a command file: same syntax as the interactive session.
fn redirect(client: &mut Client, path: &str) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .map_err(|_| anyhow::anyhow!("file not found: {path}"))?;
    let mut buffer = String::new();
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with("//") {
            continue;
        }
        if let Some(head) = line.strip_suffix(';') {
            buffer.push_str(head);
            let command = buffer.trim().to_string();
            buffer.clear();
            if !run_command(client, &command, true) {
                break;
            }
        } else {
            buffer.push_str(line);
            buffer.push(' ');
        }
    }
    Ok(())
}

impl Client {
    /// POST the request envelope and unwrap the response envelope.
    fn post(&self, endpoint: &str, param: Value, with_token: bool) -> anyhow::Result<Value> {
        let token = if with_token {
            self.token.clone().unwrap_or_default()
        } else {
            String::new()
        };
        let body: Value = self
            .http
            .post(format!("{}/{endpoint}", self.base_url))
            .json(&json!({ "authentification_token": token, "param": param }))
            .send()?
            .json()?;
        if body["success"] == json!(true) {
            Ok(body)
        } else if let Some(report) = body.get("parma_exception") {
            anyhow::bail!("{}", render_error_report(report))
        } else if let Some(exception) = body.get("exception") {
            anyhow::bail!("backend exception: {exception}")
        } else {
            anyhow::bail!("backend error")
        }
    }
}

/// Render a tagged error record: `USER_ERROR NOT_FOUND (kind=..., name=...)`.
fn render_error_report(report: &Value) -> String {
    let category = report["category"].as_str().unwrap_or("ERROR");
    let msg = report["msg"].as_str().unwrap_or("UNKNOWN");
    let params: Vec<String> = report
        .as_object()
        .into_iter()
        .flatten()
        .filter(|(key, _)| *key != "category" && *key != "msg")
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    if params.is_empty() {
        format!("{category} {msg}")
    } else {
        format!("{category} {msg} ({})", params.join(", "))
    }
}

/// `name version` pairs, a bare identifier prefix, or inline JSON.
fn referer_from_input(input: &str) -> anyhow::Result<Value> {
    let input = input.trim();
    if input.starts_with('{') {
        return Ok(serde_json::from_str(input)?);
    }
    if let Some((name, version)) = input.split_once(' ') {
        return Ok(json!({ "name": name, "version": version.trim() }));
    }
    Ok(json!({ "hash": input }))
}

fn split_on_first_whitespace(input: &str) -> (&str, &str) {
    match input.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, tail.trim()),
        None => (input, ""),
    }
}

fn print_name_version_hash(body: &Value) {
    println!(
        "name: {} version: {} hash: {}",
        body["name"].as_str().unwrap_or_default(),
        body["_version"],
        body["hash"].as_str().unwrap_or_default()
    );
}

/// Print a 2D array with aligned columns.
fn print_table(table: &Value) {
    let Some(rows) = table.as_array() else {
        return;
    };
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            row.as_array()
                .into_iter()
                .flatten()
                .map(|cell| match cell {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .collect();
    let columns = cells.iter().map(Vec::len).max().unwrap_or(0);
    let widths: Vec<usize> = (0..columns)
        .map(|i| {
            cells
                .iter()
                .filter_map(|row| row.get(i))
                .map(String::len)
                .max()
                .unwrap_or(0)
        })
        .collect();
    for row in &cells {
        let line: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{cell:<width$}", width = widths[i]))
            .collect();
        println!("{}", line.join(" | "));
    }
}
