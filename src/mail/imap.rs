//! Blocking IMAP fetch: LOGIN, SELECT/EXAMINE, UID SEARCH, UID FETCH.
//!
//! Run under `spawn_blocking`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use super::search;
use crate::config::{AccountConfig, Security};
use crate::error::MailError;

/// Largest message literal accepted from a server.
const MAX_LITERAL_BYTES: usize = 64 * 1024 * 1024;

/// Everything one poll needs, detached from the borrowed config.
#[derive(Debug)]
pub struct FetchRequest {
    pub account: String,
    pub host: String,
    pub port: u16,
    pub security: Security,
    pub username: String,
    pub password: SecretString,
    pub folders: Vec<String>,
    pub read_only: bool,
    pub query: String,
    pub work_dir: PathBuf,
    pub timeout: Duration,
}

impl FetchRequest {
    pub fn from_account(
        account: &AccountConfig,
        work_dir: &Path,
        timeout: Duration,
    ) -> Result<Self, MailError> {
        let imap = account
            .protocol
            .imap
            .as_ref()
            .ok_or_else(|| MailError::BadConfig {
                account: account.name.clone(),
                reason: "no imap settings".into(),
            })?;

        Ok(Self {
            account: account.name.clone(),
            host: imap.host.clone(),
            port: imap.port,
            security: imap.security,
            username: account.credentials.username.clone(),
            password: SecretString::from(account.credentials.password.expose_secret().to_string()),
            folders: imap.filter.folders.clone(),
            read_only: imap.filter.read_only,
            query: search::build_query(&imap.filter.conditions),
            work_dir: work_dir.to_path_buf(),
            timeout,
        })
    }
}

trait Stream: Read + Write + Send {}
impl<T: Read + Write + Send> Stream for T {}

/// Poll every configured folder and store what matched.
pub fn fetch(request: &FetchRequest) -> Result<PathBuf, MailError> {
    let stream = connect(request)?;
    let mut session = Session::new(stream, &request.host);
    session.greeting()?;
    session.login(&request.username, &request.password)?;

    let mut dest: Option<PathBuf> = None;
    for folder in &request.folders {
        session.select(folder, request.read_only)?;
        let uids = session.uid_search(&request.query)?;
        info!(account = %request.account, folder = %folder, count = uids.len(), "Messages matched filter");

        for uid in uids {
            let Some(raw) = session.uid_fetch(uid)? else {
                warn!(account = %request.account, uid, "Fetch returned no message body");
                continue;
            };
            let dir = match &dest {
                Some(dir) => dir.clone(),
                None => {
                    let dir = request.work_dir.join(batch_dir_name());
                    std::fs::create_dir_all(&dir).map_err(|source| MailError::FileCreate {
                        path: dir.clone(),
                        source,
                    })?;
                    dest = Some(dir.clone());
                    dir
                }
            };
            store_message(&dir, uid, &raw)?;
        }
    }

    session.logout();

    dest.ok_or_else(|| MailError::NoNewMail {
        account: request.account.clone(),
    })
}

fn connect(request: &FetchRequest) -> Result<Box<dyn Stream>, MailError> {
    let net = |e: &dyn std::fmt::Display| MailError::Network {
        host: request.host.clone(),
        reason: e.to_string(),
    };

    let tcp = TcpStream::connect((request.host.as_str(), request.port)).map_err(|e| net(&e))?;
    tcp.set_read_timeout(Some(request.timeout)).map_err(|e| net(&e))?;
    tcp.set_write_timeout(Some(request.timeout)).map_err(|e| net(&e))?;

    if request.security == Security::Plain {
        return Ok(Box::new(tcp));
    }

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls::pki_types::ServerName::try_from(request.host.clone())
        .map_err(|e| net(&e))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name).map_err(|e| net(&e))?;
    Ok(Box::new(rustls::StreamOwned::new(conn, tcp)))
}

/// `<YYYY-mm-dd_HH-MM-SS_mmm>`, one per poll that found mail.
fn batch_dir_name() -> String {
    Local::now().format("%Y-%m-%d_%H-%M-%S_%3f").to_string()
}

/// Write `mail-<uid>.eml` plus each attachment into `dir`.
fn store_message(dir: &Path, uid: u32, raw: &[u8]) -> Result<(), MailError> {
    let eml = dir.join(format!("mail-{uid}.eml"));
    write_file(&eml, raw)?;
    debug!(path = %eml.display(), "Message stored");

    let Some(message) = MessageParser::default().parse(raw) else {
        warn!(uid, "Message could not be parsed, attachments skipped");
        return Ok(());
    };

    for (index, part) in message.attachments().enumerate() {
        let name = part
            .attachment_name()
            .map(sanitize_file_name)
            .unwrap_or_else(|| format!("attachment-{uid}-{index}"));
        let mut path = dir.join(&name);
        if path.exists() {
            path = dir.join(format!("{uid}-{name}"));
        }
        write_file(&path, part.contents())?;
        info!(path = %path.display(), "Attachment stored");
    }
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), MailError> {
    std::fs::write(path, bytes).map_err(|source| MailError::FileCreate {
        path: path.to_path_buf(),
        source,
    })
}

/// Keep only the final path component and drop anything unsafe.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}

/// Untagged lines and literals collected for one command.
#[derive(Debug, Default)]
struct Response {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

struct Session<S> {
    reader: BufReader<S>,
    host: String,
    tag: u32,
}

impl<S: Read + Write> Session<S> {
    fn new(stream: S, host: &str) -> Self {
        Self {
            reader: BufReader::new(stream),
            host: host.to_string(),
            tag: 0,
        }
    }

    fn network(&self, e: impl std::fmt::Display) -> MailError {
        MailError::Network {
            host: self.host.clone(),
            reason: e.to_string(),
        }
    }

    fn read_line(&mut self) -> Result<Vec<u8>, MailError> {
        let mut line = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut line)
            .map_err(|e| self.network(e))?;
        if n == 0 {
            return Err(self.network("connection closed by server"));
        }
        Ok(line)
    }

    fn greeting(&mut self) -> Result<(), MailError> {
        let line = self.read_line()?;
        let text = String::from_utf8_lossy(&line);
        if text.starts_with("* OK") || text.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(MailError::Rejected(text.trim_end().to_string()))
        }
    }

    fn command(&mut self, command: &str) -> Result<Response, MailError> {
        self.tag += 1;
        let tag = format!("A{:03}", self.tag);
        let written = {
            let stream = self.reader.get_mut();
            stream
                .write_all(format!("{tag} {command}\r\n").as_bytes())
                .and_then(|()| stream.flush())
        };
        written.map_err(|e| self.network(e))?;

        let mut response = Response::default();
        loop {
            let line = self.read_line()?;
            let text = String::from_utf8_lossy(&line).trim_end().to_string();

            if let Some(len) = literal_length(&text) {
                let literal = read_literal(&mut self.reader, len).map_err(|e| self.network(e))?;
                response.literals.push(literal);
                response.lines.push(text);
                continue;
            }

            if let Some(status) = text.strip_prefix(&format!("{tag} ")) {
                if status.starts_with("OK") {
                    return Ok(response);
                }
                return Err(MailError::classify(&self.host, format!("rejected: {status}")));
            }
            response.lines.push(text);
        }
    }

    fn login(&mut self, username: &str, password: &SecretString) -> Result<(), MailError> {
        self.command(&format!(
            "LOGIN {} {}",
            quote(username),
            quote(password.expose_secret())
        ))
        .map(|_| ())
    }

    fn select(&mut self, folder: &str, read_only: bool) -> Result<(), MailError> {
        let verb = if read_only { "EXAMINE" } else { "SELECT" };
        self.command(&format!("{verb} {}", quote(folder))).map(|_| ())
    }

    fn uid_search(&mut self, query: &str) -> Result<Vec<u32>, MailError> {
        let response = self.command(&format!("UID SEARCH {query}"))?;
        Ok(parse_search(&response.lines))
    }

    fn uid_fetch(&mut self, uid: u32) -> Result<Option<Vec<u8>>, MailError> {
        let response = self.command(&format!("UID FETCH {uid} RFC822"))?;
        Ok(response.literals.into_iter().next())
    }

    fn logout(&mut self) {
        if let Err(e) = self.command("LOGOUT") {
            debug!(error = %e, "LOGOUT failed");
        }
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `... {1234}` → `Some(1234)`.
fn literal_length(line: &str) -> Option<usize> {
    let open = line.rfind('{')?;
    line[open + 1..].strip_suffix('}')?.parse().ok()
}

/// Read a `{len}` literal. The announced size is checked against
/// [`MAX_LITERAL_BYTES`] and the buffer grows with the data actually received.
fn read_literal<R: Read>(reader: &mut R, len: usize) -> std::io::Result<Vec<u8>> {
    if len > MAX_LITERAL_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("literal of {len} bytes exceeds the {MAX_LITERAL_BYTES} byte limit"),
        ));
    }
    let mut literal = Vec::new();
    reader.take(len as u64).read_to_end(&mut literal)?;
    if literal.len() < len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed inside a literal",
        ));
    }
    Ok(literal)
}

fn parse_search(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Scripted server: reads come from `input`, writes are recorded.
    struct Scripted {
        input: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn session(script: &str) -> Session<Scripted> {
        Session::new(
            Scripted {
                input: Cursor::new(script.as_bytes().to_vec()),
                written: Vec::new(),
            },
            "imap.test",
        )
    }

    #[test]
    fn literal_is_read_exactly() {
        let mut wire = Cursor::new(b"Subject: hi\r\n\r\nbody)\r\nA004 OK\r\n".to_vec());
        let literal = read_literal(&mut wire, 19).unwrap();
        assert_eq!(literal, b"Subject: hi\r\n\r\nbody");
        assert_eq!(wire.position(), 19);
    }

    #[test]
    fn oversized_literal_is_refused_before_reading() {
        let mut wire = Cursor::new(b"tiny".to_vec());
        let err = read_literal(&mut wire, usize::MAX).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert_eq!(wire.position(), 0);
    }

    #[test]
    fn truncated_literal_is_an_error() {
        let mut wire = Cursor::new(b"short".to_vec());
        let err = read_literal(&mut wire, 100).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn literal_length_parsing() {
        assert_eq!(literal_length("* 1 FETCH (UID 7 RFC822 {342}"), Some(342));
        assert_eq!(literal_length("* 1 FETCH (FLAGS (\\Seen))"), None);
    }

    #[test]
    fn search_response_parsing() {
        let lines = vec!["* SEARCH 4 9 12".to_string(), "* OK done".to_string()];
        assert_eq!(parse_search(&lines), vec![4, 9, 12]);
        assert!(parse_search(&["* SEARCH".to_string()]).is_empty());
    }

    #[test]
    fn fetch_reads_literal_body() {
        let body = "Subject: hi\r\n\r\nhello\r\n";
        let script = format!(
            "* 1 FETCH (UID 7 RFC822 {{{}}}\r\n{body})\r\nA001 OK FETCH completed\r\n",
            body.len()
        );
        let mut s = session(&script);
        let raw = s.uid_fetch(7).unwrap().unwrap();
        assert_eq!(raw, body.as_bytes());
        assert_eq!(s.reader.get_ref().written, b"A001 UID FETCH 7 RFC822\r\n");
    }

    #[test]
    fn tagged_no_is_a_rejection() {
        let mut s = session("A001 NO [AUTHENTICATIONFAILED] Invalid credentials\r\n");
        let err = s
            .login("user", &SecretString::from("pw".to_string()))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Rejection);
    }

    #[test]
    fn closed_connection_is_a_network_error() {
        let mut s = session("");
        let err = s.greeting().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Network);
    }

    #[test]
    fn select_uses_examine_when_read_only() {
        let mut s = session("* 3 EXISTS\r\nA001 OK [READ-ONLY] done\r\n");
        s.select("inbox", true).unwrap();
        assert_eq!(s.reader.get_ref().written, b"A001 EXAMINE \"inbox\"\r\n");
    }

    #[test]
    fn attachment_names_are_sanitized() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\jobs\\bundle.zip"), "bundle.zip");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name(""), "attachment");
    }

    #[test]
    fn stores_message_and_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let raw = concat!(
            "From: ops@example.com\r\n",
            "Subject: bundle\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "see attached\r\n",
            "--b\r\n",
            "Content-Type: application/x-yaml\r\n",
            "Content-Disposition: attachment; filename=\"job.yaml\"\r\n",
            "\r\n",
            "name: demo\r\n",
            "--b--\r\n",
        );
        store_message(dir.path(), 5, raw.as_bytes()).unwrap();

        assert!(dir.path().join("mail-5.eml").exists());
        let job = std::fs::read_to_string(dir.path().join("job.yaml")).unwrap();
        assert!(job.starts_with("name: demo"));
    }
}
