use crate::errors::{Error, Result};
use k3sd_api::Node;

use async_trait::async_trait;
use log;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SSH_PORT: u16 = 22;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/* values following these markers never reach the logs */
const SECRET_MARKERS: &[&str] = &["K3S_TOKEN='"];

/*
 * Whether the output of a command may be logged. Commands printing
 * credentials (the kubeconfig, join tokens) run quiet.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    Output,
    Quiet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,

    /* stdout and stderr, merged in the order the host produced them */
    pub output: String,
}

/*
 * An open session to a remote host.
 */
#[async_trait]
pub trait Session: Send + Sync {
    fn address(&self) -> &str;

    async fn exec(&self, command: &str, echo: Echo) -> Result<CommandOutput>;

    fn close(&self);
}

/*
 * Opens sessions to nodes. The production implementation speaks SSH, tests
 * plug in a recording fake.
 */
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, node: &Node) -> Result<Arc<dyn Session>>;
}

/*
 * Masks the single quoted value following each secret marker.
 */
pub fn redact(command: &str) -> String {
    let mut out = command.to_string();

    for marker in SECRET_MARKERS {
	if let Some(start) = out.find(marker) {
	    let from = start + marker.len();
	    let end = out[from..].find('\'').map(|i| from + i).unwrap_or(out.len());
	    out.replace_range(from..end, "***");
	}
    }
    out
}

async fn run_with(session: &dyn Session, command: &str, echo: Echo) -> Result<String> {
    log::info!("[{}] $ {}", session.address(), redact(command));

    let out = session.exec(command, echo).await?;
    if out.status != 0 {
	return Err(Error::Command{
	    command: redact(command),
	    status: out.status,
	    output: out.output,
	});
    }
    Ok(out.output)
}

/*
 * Runs a single command, turning a non-zero exit status into
 * `Error::Command`. Returns the command output.
 */
pub async fn run(session: &dyn Session, command: &str) -> Result<String> {
    run_with(session, command, Echo::Output).await
}

/*
 * Same as `run` for commands whose output holds credentials.
 */
pub async fn run_quiet(session: &dyn Session, command: &str) -> Result<String> {
    run_with(session, command, Echo::Quiet).await
}

/*
 * Runs the commands in order and stops at the first failure.
 */
pub async fn run_all(session: &dyn Session, commands: &[String]) -> Result<()> {
    for command in commands {
	run(session, command).await?;
    }
    Ok(())
}

/*
 * SessionScope owns every session opened while processing one cluster and
 * closes all of them when it goes out of scope, whichever step failed.
 */
pub struct SessionScope<'a> {
    connector: &'a dyn Connector,
    sessions: Vec<Arc<dyn Session>>,
}

impl<'a> SessionScope<'a> {

    pub fn new(connector: &'a dyn Connector) -> Self {
	Self{
	    connector: connector,
	    sessions: Vec::new(),
	}
    }

    pub async fn open(&mut self, node: &Node) -> Result<Arc<dyn Session>> {
	let session = self.connector.connect(node).await?;
	self.sessions.push(session.clone());

	Ok(session)
    }
}

impl Drop for SessionScope<'_> {
    fn drop(&mut self) {
	for session in self.sessions.drain(..) {
	    log::debug!("Closing session to {}", session.address());
	    session.close();
	}
    }
}

/*
 * Commands starting with sudo are switched to read the password from stdin,
 * the password is then written to the channel right after exec.
 */
pub fn sudo_command(command: &str, password: &str) -> (String, bool) {
    match command.strip_prefix("sudo ") {
	Some(rest) if !password.is_empty() => (format!("sudo -S -p '' {}", rest), true),
	_ => (command.to_string(), false),
    }
}

pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, node: &Node) -> Result<Arc<dyn Session>> {
	let target = node.clone();
	let session = tokio::task::spawn_blocking(move || ssh_connect(&target))
	    .await
	    .map_err(|err| Error::Connection(format!("{}: {}", node.address, err)))??;

	log::info!("Connected to {} as {}", node.address, node.user);
	Ok(Arc::new(SshSession{
	    address: node.address.clone(),
	    password: node.password.clone(),
	    inner: Arc::new(Mutex::new(session)),
	}))
    }
}

fn ssh_connect(node: &Node) -> Result<ssh2::Session> {
    let target = match node.address.contains(':') {
	true => node.address.clone(),
	false => format!("{}:{}", node.address, SSH_PORT),
    };
    let addr = match target.to_socket_addrs()?.next() {
	Some(addr) => addr,
	None => {
	    return Err(Error::Connection(format!("unable to resolve {}", target)));
	}
    };

    let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
	.map_err(|err| Error::Connection(format!("{}: {}", target, err)))?;
    let mut session = ssh2::Session::new()?;
    session.set_tcp_stream(tcp);
    session.handshake()?;
    session.userauth_password(&node.user, &node.password)?;

    if !session.authenticated() {
	return Err(Error::Connection(format!("authentication to {} as {} failed", target, node.user)));
    }
    Ok(session)
}

pub struct SshSession {
    address: String,
    password: String,
    inner: Arc<Mutex<ssh2::Session>>,
}

#[async_trait]
impl Session for SshSession {
    fn address(&self) -> &str {
	self.address.as_str()
    }

    async fn exec(&self, command: &str, echo: Echo) -> Result<CommandOutput> {
	let inner = self.inner.clone();
	let address = self.address.clone();
	let (command, needs_password) = sudo_command(command, &self.password);
	let password = match needs_password {
	    true => Some(self.password.clone()),
	    false => None,
	};

	tokio::task::spawn_blocking(move || {
	    let session = inner.lock()
		.map_err(|_| Error::Connection(format!("session to {} is poisoned", address)))?;
	    ssh_exec(&session, &address, &command, password.as_deref(), echo)
	})
	.await
	.map_err(|err| Error::Other(err.to_string()))?
    }

    fn close(&self) {
	if let Ok(session) = self.inner.lock() {
	    if let Err(err) = session.disconnect(None, "k3sd done", None) {
		log::warn!("Unable to close session to {}: {}", self.address, err);
	    }
	}
    }
}

fn ssh_exec(session: &ssh2::Session, address: &str, command: &str, password: Option<&str>, echo: Echo) -> Result<CommandOutput> {
    let mut channel = session.channel_session()?;
    channel.handle_extended_data(ssh2::ExtendedData::Merge)?;
    channel.exec(command)?;

    if let Some(password) = password {
	channel.write_all(format!("{}\n", password).as_bytes())?;
    }
    channel.send_eof()?;

    let mut output = String::new();
    {
	let reader = BufReader::new(&mut channel);
	for line in reader.lines() {
	    let line = line?;
	    if echo == Echo::Output {
		log::debug!("[{}] {}", address, line);
	    }

	    output.push_str(&line);
	    output.push('\n');
	}
    }

    channel.wait_close()?;
    let status = channel.exit_status()?;

    Ok(CommandOutput{
	status: status,
	output: output,
    })
}


#[cfg(test)]
mod tests {
    use super::fake::FakeConnector;
    use super::*;

    #[test]
    fn sudo_commands_read_password_from_stdin() {
	let (cmd, pw) = sudo_command("sudo apt-get update -y", "secret");
	assert_eq!(cmd, "sudo -S -p '' apt-get update -y");
	assert!(pw);

	let (cmd, pw) = sudo_command("sudo apt-get update -y", "");
	assert_eq!(cmd, "sudo apt-get update -y");
	assert!(!pw);

	let (cmd, pw) = sudo_command("ssh root@10.0.0.2 \"sudo true\"", "secret");
	assert_eq!(cmd, "ssh root@10.0.0.2 \"sudo true\"");
	assert!(!pw);
    }

    #[tokio::test]
    async fn run_all_stops_at_first_failure() {
	let mut connector = FakeConnector::default();
	connector.failing.insert(String::from("false"));
	let session = connector.connect(&Node::new("10.0.0.1", "root", "p", "m")).await.unwrap();

	let commands = vec![String::from("true"), String::from("false"), String::from("echo never")];
	let err = run_all(session.as_ref(), &commands).await.unwrap_err();

	assert!(matches!(err, Error::Command{ status: 1, .. }));
	assert_eq!(connector.all_commands(), vec!["true", "false"]);
    }

    #[test]
    fn join_tokens_are_masked() {
	let command = "curl -sfL https://get.k3s.io | K3S_URL=https://10.0.0.1:6443 K3S_TOKEN='K10abc::server:def' sh -";

	assert_eq!(redact(command), "curl -sfL https://get.k3s.io | K3S_URL=https://10.0.0.1:6443 K3S_TOKEN='***' sh -");
	assert_eq!(redact("sudo apt-get update -y"), "sudo apt-get update -y");
	assert_eq!(redact("K3S_TOKEN='unterminated"), "K3S_TOKEN='***");
    }

    #[tokio::test]
    async fn failed_commands_do_not_carry_secrets() {
	let mut connector = FakeConnector::default();
	connector.failing.insert(String::from("curl"));
	let session = connector.connect(&Node::new("10.0.0.1", "root", "p", "m")).await.unwrap();

	let err = run(session.as_ref(), "curl -sfL https://get.k3s.io | K3S_TOKEN='K10secret' sh -").await.unwrap_err();

	assert!(!err.to_string().contains("K10secret"));
	assert!(connector.quiet.lock().unwrap().is_empty());

	run_quiet(session.as_ref(), "echo $(k3s token create)").await.unwrap();
	assert_eq!(*connector.quiet.lock().unwrap(), vec!["echo $(k3s token create)"]);
    }

    #[tokio::test]
    async fn scope_closes_sessions_on_drop() {
	let connector = FakeConnector::default();
	{
	    let mut scope = SessionScope::new(&connector);
	    scope.open(&Node::new("10.0.0.1", "root", "p", "m")).await.unwrap();
	    scope.open(&Node::new("10.0.0.2", "root", "p", "w")).await.unwrap();
	}
	assert_eq!(*connector.closed.lock().unwrap(), vec!["10.0.0.1", "10.0.0.2"]);
    }
}
