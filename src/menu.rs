//! Interactive container selection.
//!
//! The menu is rendered once, then the client's keystrokes are consumed one
//! byte at a time through a [`LineEditor`]. Each committed line resolves to a
//! [`Choice`]; bad input re-prompts, `quit`/`exit` ends the channel, and a
//! running container hands the channel to the relay for good.

use std::future::Future;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::channel_io::{ChannelClosed, ClientIo};
use crate::directory::{Container, DirectoryError};

pub const FAREWELL: &str = "\r\nGoodbye!\r\n";
pub const INVALID_SELECTION: &str = "\r\nInvalid selection. Try again: ";
pub const RETRY_PROMPT: &str = "Select another container or 'quit': ";
const ERASE: &[u8] = b"\x08 \x08";

/// Number of log lines shown by the `logs` command.
pub const LOG_LINES: u32 = 50;

/// What a single input byte did to the line buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    /// CR or LF: the buffered line, already removed from the buffer.
    Commit(String),
    /// Printable byte appended to the buffer; echo it back.
    Echo(u8),
    /// Last character removed; emit the erase sequence.
    Erase,
    /// Nothing changed and nothing should be written.
    Ignored,
}

/// Accumulates one line of raw terminal input.
#[derive(Debug, Default)]
pub struct LineEditor {
    buffer: String,
}

impl LineEditor {
    pub fn feed(&mut self, byte: u8) -> Key {
        match byte {
            b'\r' | b'\n' => Key::Commit(std::mem::take(&mut self.buffer)),
            0x7f | 0x08 => {
                if self.buffer.pop().is_some() {
                    Key::Erase
                } else {
                    Key::Ignored
                }
            }
            0x20..=0x7e => {
                self.buffer.push(byte as char);
                Key::Echo(byte)
            }
            _ => Key::Ignored,
        }
    }

    #[cfg(test)]
    pub fn buffer(&self) -> &str {
        &self.buffer
    }
}

/// Outcome of a committed line.
#[derive(Debug, PartialEq, Eq)]
pub enum Choice<'a> {
    Quit,
    Invalid,
    Stopped(&'a Container),
    Connect(&'a Container),
    Logs(&'a Container),
}

/// The container snapshot plus line state for one channel.
pub struct Menu {
    containers: Arc<Vec<Container>>,
    editor: LineEditor,
}

impl Menu {
    pub fn new(containers: Arc<Vec<Container>>) -> Self {
        Self {
            containers,
            editor: LineEditor::default(),
        }
    }

    pub fn containers(&self) -> &[Container] {
        &self.containers
    }

    /// Header plus one line per container, or the "no containers" notice.
    pub fn render(&self, create_hint: &str) -> String {
        let mut out = String::from("\r\n=== SSH Platform - Container Gateway ===\r\n\r\n");

        if self.containers.is_empty() {
            out.push_str("No containers available.\r\n");
            out.push_str(&format!("Create containers via: {}\r\n", create_hint));
            return out;
        }

        out.push_str("Available containers:\r\n\r\n");
        for (i, container) in self.containers.iter().enumerate() {
            out.push_str(&menu_line(i + 1, container));
        }
        out
    }

    pub fn prompt(&self) -> String {
        format!(
            "\r\nSelect container number (1-{}) or 'quit': ",
            self.containers.len()
        )
    }

    pub fn resolve(&self, line: &str) -> Choice<'_> {
        let line = line.trim();
        if line == "quit" || line == "exit" {
            return Choice::Quit;
        }

        if let Some(rest) = line.strip_prefix("logs ") {
            return match self.lookup(rest.trim()) {
                Some(container) => Choice::Logs(container),
                None => Choice::Invalid,
            };
        }

        match self.lookup(line) {
            Some(container) if container.running => Choice::Connect(container),
            Some(container) => Choice::Stopped(container),
            None => Choice::Invalid,
        }
    }

    /// 1-based index lookup.
    fn lookup(&self, index: &str) -> Option<&Container> {
        let index: usize = index.parse().ok()?;
        index.checked_sub(1).and_then(|i| self.containers.get(i))
    }
}

pub fn menu_line(index: usize, container: &Container) -> String {
    let status = if container.running {
        "Running"
    } else {
        "Stopped"
    };
    format!(
        "{}. {} ({}) - {} - Port: {}\r\n",
        index,
        container.name,
        container.short_id(),
        status,
        container.ssh_port
    )
}

pub fn not_running_message(container: &Container) -> String {
    format!(
        "\r\nContainer '{}' is not running. Please start it first.\r\n{}",
        container.name, RETRY_PROMPT
    )
}

pub fn connecting_message(container: &Container) -> String {
    format!("\r\nConnecting to container '{}'...\r\n", container.name)
}

pub fn format_logs(container: &Container, lines: &[String]) -> String {
    let mut out = format!("\r\nContainer Logs - {}\r\n==================\r\n", container.name);
    for line in lines {
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

/// What the selection flow can ask of the rest of the gateway.
pub trait SelectionActions: Send + Sync {
    /// Relay the channel into `container` until the backend session ends.
    fn relay(&self, client: ClientIo, container: Container) -> impl Future<Output = ()> + Send;

    /// Recent log lines of `container`.
    fn logs(
        &self,
        container: &Container,
    ) -> impl Future<Output = Result<Vec<String>, DirectoryError>> + Send;
}

/// How a selection flow ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionEnd {
    NoContainers,
    Quit,
    Relayed,
    Disconnected,
}

impl From<ChannelClosed> for SelectionEnd {
    fn from(_: ChannelClosed) -> Self {
        SelectionEnd::Disconnected
    }
}

/// Drive the menu on `client` until the user quits, disconnects or is relayed.
pub async fn run_selection<A: SelectionActions>(
    mut menu: Menu,
    mut client: ClientIo,
    actions: &A,
    create_hint: &str,
) -> SelectionEnd {
    match drive(&mut menu, &mut client, actions, create_hint).await {
        Ok(Some(container)) => {
            actions.relay(client, container).await;
            SelectionEnd::Relayed
        }
        Ok(None) if menu.containers().is_empty() => SelectionEnd::NoContainers,
        Ok(None) => SelectionEnd::Quit,
        Err(end) => end,
    }
}

/// Menu loop. Returns the container to relay into, or `None` when the flow
/// ends without one.
async fn drive<A: SelectionActions>(
    menu: &mut Menu,
    client: &mut ClientIo,
    actions: &A,
    create_hint: &str,
) -> Result<Option<Container>, SelectionEnd> {
    client.write(&menu.render(create_hint)).await?;
    if menu.containers().is_empty() {
        return Ok(None);
    }
    client.write(&menu.prompt()).await?;

    loop {
        let byte = match client.input.read_u8().await {
            Ok(byte) => byte,
            Err(e) => {
                debug!("Client input ended during selection: {}", e);
                return Err(SelectionEnd::Disconnected);
            }
        };

        let line = match menu.editor.feed(byte) {
            Key::Commit(line) => line,
            Key::Echo(byte) => {
                client.output.send(vec![byte]).await.map_err(|_| ChannelClosed)?;
                continue;
            }
            Key::Erase => {
                client.output.send(ERASE.to_vec()).await.map_err(|_| ChannelClosed)?;
                continue;
            }
            Key::Ignored => continue,
        };

        match menu.resolve(&line) {
            Choice::Quit => {
                client.write(FAREWELL).await?;
                return Ok(None);
            }
            Choice::Invalid => client.write(INVALID_SELECTION).await?,
            Choice::Stopped(container) => {
                info!("Refusing stopped container '{}'", container.name);
                client.write(&not_running_message(container)).await?;
            }
            Choice::Logs(container) => {
                let text = match actions.logs(container).await {
                    Ok(lines) => format_logs(container, &lines),
                    Err(e) => {
                        warn!("Failed to fetch logs for '{}': {}", container.name, e);
                        format!("\r\nFailed to fetch logs for '{}'.\r\n", container.name)
                    }
                };
                client.write(&text).await?;
                client.write(RETRY_PROMPT).await?;
            }
            Choice::Connect(container) => {
                client.write(&connecting_message(container)).await?;
                return Ok(Some(container.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    fn container(name: &str, running: bool, port: u16, id: &str) -> Container {
        Container {
            id: port as i64,
            container_id: id.to_string(),
            name: name.to_string(),
            status: if running { "RUNNING" } else { "STOPPED" }.to_string(),
            ssh_port: port,
            running,
        }
    }

    fn sample() -> Arc<Vec<Container>> {
        Arc::new(vec![
            container("test-container", true, 8001, "abc123def456xyz"),
            container("stopped-one", false, 8002, "0123456789abcdef"),
        ])
    }

    #[derive(Default)]
    struct Recorder {
        relayed: Mutex<Vec<String>>,
        fail_logs: bool,
    }

    impl SelectionActions for Recorder {
        async fn relay(&self, client: ClientIo, container: Container) {
            self.relayed.lock().unwrap().push(container.name.clone());
            let _ = client.write("[relayed]").await;
        }

        async fn logs(&self, container: &Container) -> Result<Vec<String>, DirectoryError> {
            if self.fail_logs {
                Err(DirectoryError::Status(reqwest::StatusCode::BAD_GATEWAY))
            } else {
                Ok(vec![format!("{} booted", container.name), "ready".to_string()])
            }
        }
    }

    struct Harness {
        keys: DuplexStream,
        output: mpsc::Receiver<Vec<u8>>,
        client: ClientIo,
    }

    fn harness() -> Harness {
        let (keys, input) = tokio::io::duplex(1024);
        let (tx, output) = mpsc::channel(1024);
        Harness {
            keys,
            output,
            client: ClientIo { input, output: tx },
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Vec<u8>>) -> String {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.extend(chunk);
        }
        String::from_utf8(out).unwrap()
    }

    async fn run(
        containers: Arc<Vec<Container>>,
        typed: &[u8],
        actions: &Recorder,
    ) -> (SelectionEnd, String) {
        let Harness {
            mut keys,
            mut output,
            client,
        } = harness();
        keys.write_all(typed).await.unwrap();
        // Closing the keyboard makes a flow that is still waiting end as Disconnected.
        drop(keys);

        let end = tokio::time::timeout(
            Duration::from_secs(5),
            run_selection(
                Menu::new(containers),
                client,
                actions,
                "curl -X POST http://x/api/containers",
            ),
        )
        .await
        .unwrap();
        (end, drain(&mut output))
    }

    #[test]
    fn editor_echoes_printable_and_commits_on_cr_or_lf() {
        let mut editor = LineEditor::default();
        assert_eq!(editor.feed(b'4'), Key::Echo(b'4'));
        assert_eq!(editor.feed(b'2'), Key::Echo(b'2'));
        assert_eq!(editor.feed(b'\r'), Key::Commit("42".to_string()));
        assert_eq!(editor.buffer(), "");
        assert_eq!(editor.feed(b'\n'), Key::Commit(String::new()));
    }

    #[test]
    fn backspace_on_empty_buffer_is_a_no_op() {
        let mut editor = LineEditor::default();
        assert_eq!(editor.feed(0x7f), Key::Ignored);
        assert_eq!(editor.feed(0x08), Key::Ignored);
        assert_eq!(editor.buffer(), "");

        editor.feed(b'a');
        assert_eq!(editor.feed(0x08), Key::Erase);
        assert_eq!(editor.feed(0x7f), Key::Ignored);
        assert_eq!(editor.buffer(), "");
    }

    #[test]
    fn control_and_high_bytes_are_ignored() {
        let mut editor = LineEditor::default();
        for byte in [0x00, 0x03, 0x1b, 0x09, 0x80, 0xff] {
            assert_eq!(editor.feed(byte), Key::Ignored);
        }
        assert_eq!(editor.buffer(), "");
    }

    #[test]
    fn menu_line_shows_index_name_short_id_status_and_port() {
        let menu = Menu::new(Arc::new(vec![container(
            "test-container",
            true,
            8001,
            "abc123def456xyz",
        )]));
        let rendered = menu.render("hint");
        assert!(rendered.contains("1. test-container (abc123def456) - Running - Port: 8001\r\n"));
        assert!(!rendered.contains("abc123def456x"));
    }

    #[test]
    fn empty_menu_shows_create_hint() {
        let menu = Menu::new(Arc::new(Vec::new()));
        let rendered = menu.render("curl -X POST http://x/api/containers");
        assert!(rendered.contains("No containers available."));
        assert!(rendered.contains("curl -X POST http://x/api/containers"));
    }

    #[test]
    fn only_indices_in_range_select() {
        let menu = Menu::new(sample());
        assert!(matches!(menu.resolve("1"), Choice::Connect(c) if c.name == "test-container"));
        assert!(matches!(menu.resolve(" 2 "), Choice::Stopped(c) if c.name == "stopped-one"));
        for bad in ["0", "3", "-1", "one", "", "1.0", "99999999999999999999999"] {
            assert_eq!(menu.resolve(bad), Choice::Invalid, "input {:?}", bad);
        }
    }

    #[test]
    fn quit_and_exit_are_trimmed() {
        let menu = Menu::new(sample());
        assert_eq!(menu.resolve("quit"), Choice::Quit);
        assert_eq!(menu.resolve("  exit "), Choice::Quit);
        assert_eq!(menu.resolve("QUIT"), Choice::Invalid);
    }

    #[test]
    fn logs_command_takes_an_index() {
        let menu = Menu::new(sample());
        assert!(matches!(menu.resolve("logs 2"), Choice::Logs(c) if c.name == "stopped-one"));
        assert_eq!(menu.resolve("logs 3"), Choice::Invalid);
        assert_eq!(menu.resolve("logs"), Choice::Invalid);
    }

    #[tokio::test]
    async fn running_container_is_relayed() {
        let actions = Recorder::default();
        let (end, out) = run(sample(), b"1\r", &actions).await;

        assert_eq!(end, SelectionEnd::Relayed);
        assert_eq!(*actions.relayed.lock().unwrap(), vec!["test-container".to_string()]);
        assert!(out.contains("Select container number (1-2) or 'quit': "));
        assert!(out.contains("Connecting to container 'test-container'...\r\n[relayed]"));
    }

    #[tokio::test]
    async fn bad_lines_reprompt_without_closing() {
        let actions = Recorder::default();
        let (end, out) = run(sample(), b"0\r3\rabc\r1\r", &actions).await;

        assert_eq!(end, SelectionEnd::Relayed);
        assert_eq!(out.matches(INVALID_SELECTION).count(), 3);
        // The menu is drawn once.
        assert_eq!(out.matches("Available containers:").count(), 1);
    }

    #[tokio::test]
    async fn stopped_container_never_relays() {
        let actions = Recorder::default();
        let (end, out) = run(sample(), b"2\r", &actions).await;

        assert_eq!(end, SelectionEnd::Disconnected);
        assert!(actions.relayed.lock().unwrap().is_empty());
        assert!(out.contains("Container 'stopped-one' is not running. Please start it first.\r\n"));
        assert!(out.ends_with(RETRY_PROMPT));
    }

    #[tokio::test]
    async fn quit_after_erased_text_says_goodbye() {
        let actions = Recorder::default();
        let (end, out) = run(sample(), b"12\x7f\x7f\x7fquit\r", &actions).await;

        assert_eq!(end, SelectionEnd::Quit);
        assert!(actions.relayed.lock().unwrap().is_empty());
        assert!(out.ends_with(FAREWELL));
        // Two erasures for two characters; the third backspace writes nothing.
        assert_eq!(out.matches("\x08 \x08").count(), 2);
    }

    #[tokio::test]
    async fn typed_characters_are_echoed() {
        let actions = Recorder::default();
        let (_, out) = run(sample(), b"e\x01x\x1bit\n", &actions).await;
        let prompt = "or 'quit': ";
        let after_prompt = &out[out.find(prompt).unwrap() + prompt.len()..];
        assert!(after_prompt.starts_with("exit"));
        assert!(out.ends_with(FAREWELL));
    }

    #[tokio::test]
    async fn empty_listing_ends_without_prompt() {
        let actions = Recorder::default();
        let (end, out) = run(Arc::new(Vec::new()), b"1\r", &actions).await;

        assert_eq!(end, SelectionEnd::NoContainers);
        assert!(out.contains("No containers available."));
        assert!(!out.contains("Select container number"));
        assert!(actions.relayed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn logs_are_printed_then_reprompted() {
        let actions = Recorder::default();
        let (end, out) = run(sample(), b"logs 1\rquit\r", &actions).await;

        assert_eq!(end, SelectionEnd::Quit);
        assert!(out.contains(
            "Container Logs - test-container\r\n==================\r\n\
             test-container booted\r\nready\r\n"
        ));
        assert!(out.contains(RETRY_PROMPT));
    }

    #[tokio::test]
    async fn log_failure_is_reported_generically() {
        let actions = Recorder {
            fail_logs: true,
            ..Default::default()
        };
        let (end, out) = run(sample(), b"logs 1\rquit\r", &actions).await;

        assert_eq!(end, SelectionEnd::Quit);
        assert!(out.contains("Failed to fetch logs for 'test-container'."));
        assert!(!out.contains("502"));
    }

    #[tokio::test]
    async fn closed_input_ends_as_disconnected() {
        let actions = Recorder::default();
        let (end, _) = run(sample(), b"1", &actions).await;
        assert_eq!(end, SelectionEnd::Disconnected);
    }
}
