//! Terminal front-ends behind the `server` and `client` subcommands.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    cli::{ClientArgs, ServerArgs},
    client::Client,
    envelope::{CLIENTS_LIST_CHANGED, CONNECTION_CLOSED, GET_CLIENTS_LIST, SERVER_SHUTDOWN},
    registry::ClientInfo,
    server::Server,
};

/// Responder installed by the server binary: answers with the request body.
pub const ECHO: &str = "echo";
/// Event broadcast by the server binary when `--ping-interval-ms` is set.
pub const PING: &str = "ping";

/// Inbound keys the terminal client renders.
const PRINTED: [&str; 6] = [
    CLIENTS_LIST_CHANGED,
    GET_CLIENTS_LIST,
    SERVER_SHUTDOWN,
    CONNECTION_CLOSED,
    ECHO,
    PING,
];

pub async fn run_server(args: ServerArgs) -> Result<()> {
    let server = Server::bind(args.listen).await?;
    if args.closed {
        server.close_registration();
    }
    server.add_response(ECHO, |body: &str| Value::from(body));
    server.add_event(PING, || json!({ "t": Utc::now().timestamp_millis() }));
    server.run()?;

    write_stdout(&format!("server listening on {}", server.local_addr())).await?;

    let pinger = args
        .ping_interval_ms
        .map(|millis| spawn_pinger(server.clone(), Duration::from_millis(millis.max(1))));

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
    if let Some(pinger) = pinger {
        pinger.abort();
    }
    server.shutdown().await;

    Ok(())
}

fn spawn_pinger(server: Server, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = server.send_event(PING) {
                warn!(error = ?err, "ping event failed, stopping pinger");
                break;
            }
        }
    })
}

pub async fn run_client(args: ClientArgs) -> Result<()> {
    let client = Client::connect(args.server).await?;
    let mut printed = install_printers(&client);

    client.register(&args.nickname)?;
    let id = client
        .registration()
        .await
        .with_context(|| format!("registration as '{}' failed", args.nickname))?;
    info!(%id, "registered");
    write_stdout(&format!("*** connected as {}#{id}", args.nickname)).await?;

    let mut stdin = BufReader::new(io::stdin()).lines();
    loop {
        select! {
            line = stdin.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_input(&client, line.trim()).await? {
                    break;
                }
            }
            Some(line) = printed.recv() => write_stdout(&line).await?,
            _ = client.closed() => break,
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(err) = ctrl_c {
                    warn!(error = ?err, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    client.close_connection();
    client.closed().await;
    while let Ok(line) = printed.try_recv() {
        write_stdout(&line).await?;
    }
    Ok(())
}

async fn handle_input(client: &Client, text: &str) -> Result<bool> {
    if text.is_empty() {
        return Ok(true);
    }
    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving lobby").await?;
        return Ok(false);
    }
    if text.eq_ignore_ascii_case("/list") {
        client.send_request(GET_CLIENTS_LIST, "")?;
        return Ok(true);
    }

    let (key, body) = parse_request(text);
    client.send_request(key, body)?;
    Ok(true)
}

/// Splits `KEY [BODY]`; everything after the first space is the body.
fn parse_request(text: &str) -> (&str, &str) {
    text.split_once(' ')
        .map(|(key, body)| (key, body.trim_start()))
        .unwrap_or((text, ""))
}

/// Routes every printed message through one queue so that only the
/// console loop writes to stdout.
fn install_printers(client: &Client) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    for key in PRINTED {
        let tx = tx.clone();
        client.add_message_handler(key, move |body: &Value| {
            let _ = tx.send(render_message(key, body));
        });
    }
    rx
}

fn render_message(key: &str, body: &Value) -> String {
    match key {
        CLIENTS_LIST_CHANGED | GET_CLIENTS_LIST => format_clients_list(body),
        SERVER_SHUTDOWN => "*** server shutting down".to_string(),
        CONNECTION_CLOSED => "*** connection closed".to_string(),
        ECHO => match body.as_str() {
            Some(text) => format!("<echo> {text}"),
            None => format!("<echo> {body}"),
        },
        PING => format!("*** ping {}", body.get("t").unwrap_or(&Value::Null)),
        _ => format!("<{key}> {body}"),
    }
}

#[derive(Deserialize)]
struct ClientsList {
    clients_list: Vec<ClientInfo>,
}

fn format_clients_list(body: &Value) -> String {
    match ClientsList::deserialize(body) {
        Ok(list) if list.clients_list.is_empty() => "*** nobody online".to_string(),
        Ok(list) => {
            let names: Vec<String> = list
                .clients_list
                .iter()
                .map(|client| format!("{}#{}", client.nickname, client.id))
                .collect();
            format!("*** online: {}", names.join(", "))
        }
        Err(_) => format!("*** clients list: {body}"),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clients_list_is_rendered_in_order() {
        let body = json!({
            "clients_list": [
                { "id": "1", "nickname": "A" },
                { "id": "2", "nickname": "B" }
            ]
        });
        assert_eq!(format_clients_list(&body), "*** online: A#1, B#2");
        assert_eq!(
            format_clients_list(&json!({ "clients_list": [] })),
            "*** nobody online"
        );
        assert_eq!(
            format_clients_list(&json!("odd")),
            "*** clients list: \"odd\""
        );
    }

    #[test]
    fn messages_render_as_single_lines() {
        assert_eq!(render_message(ECHO, &json!("hi there")), "<echo> hi there");
        assert_eq!(render_message(ECHO, &json!({ "n": 1 })), r#"<echo> {"n":1}"#);
        assert_eq!(render_message(PING, &json!({ "t": 42 })), "*** ping 42");
        assert_eq!(
            render_message(SERVER_SHUTDOWN, &json!({ "shutdown_timestamp": "now" })),
            "*** server shutting down"
        );
    }

    #[tokio::test]
    async fn printers_feed_one_queue_in_arrival_order() {
        use crate::envelope::{Push, write_envelope};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (client, accepted) = tokio::join!(Client::connect(addr), listener.accept());
        let client = client.expect("connect");
        let (_reader, mut writer) = accepted.expect("accept").0.into_split();
        let mut printed = install_printers(&client);

        write_envelope(&mut writer, &Push::new(ECHO, json!("one")))
            .await
            .expect("echo");
        write_envelope(&mut writer, &Push::new(PING, json!({ "t": 7 })))
            .await
            .expect("ping");
        drop(writer);

        let mut lines = Vec::new();
        while lines.len() < 3 {
            let line = tokio::time::timeout(Duration::from_secs(1), printed.recv())
                .await
                .expect("timely")
                .expect("queue open");
            lines.push(line);
        }
        assert_eq!(
            lines,
            ["<echo> one", "*** ping 7", "*** connection closed"]
        );
    }

    #[test]
    fn request_lines_split_on_first_space() {
        assert_eq!(parse_request("echo hello there"), ("echo", "hello there"));
        assert_eq!(parse_request("get_clients_list"), ("get_clients_list", ""));
        assert_eq!(parse_request("move   {\"x\":1}"), ("move", "{\"x\":1}"));
    }
}
