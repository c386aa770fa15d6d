use std::fmt;
use std::future::Future;

use async_imap::error::Error as ImapError;
use async_imap::{Client, Session};
use futures::TryStreamExt;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use crate::mail_reader::error::{Result, SyncError};
use crate::mail_reader::fetch::{MailboxSession, SelectionCriterion};
use crate::mail_reader::message::RawMessage;

type ImapStream = Compat<tokio_native_tls::TlsStream<TcpStream>>;

/// Login and password for one session. Never written anywhere.
#[derive(Clone)]
pub struct Credentials {
    pub address: String,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("address", &self.address)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// How the folder is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// EXAMINE; messages are fetched with `BODY.PEEK[]` and stay unread.
    #[default]
    ReadOnly,
    /// SELECT; messages are fetched with `RFC822`, which marks them seen.
    ReadWrite,
}

/// Opens sessions against one mailbox server.
pub trait Connector {
    type Session: MailboxSession + Send;

    fn open(
        &self,
        credentials: &Credentials,
        folder: &str,
        mode: AccessMode,
    ) -> impl Future<Output = Result<Self::Session>> + Send;
}

#[derive(Debug, Clone)]
pub struct ImapConnector {
    pub server: String,
    pub port: u16,
}

impl ImapConnector {
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        Self {
            server: server.into(),
            port,
        }
    }
}

impl Connector for ImapConnector {
    type Session = ImapSession;

    async fn open(&self, credentials: &Credentials, folder: &str, mode: AccessMode) -> Result<ImapSession> {
        let tls_stream = connect_to_server(&self.server, self.port).await?;
        let client = Client::new(tls_stream.compat());
        let mut session = login_to_server(client, &credentials.address, &credentials.secret).await?;

        let selected = match mode {
            AccessMode::ReadOnly => session.examine(folder).await,
            AccessMode::ReadWrite => session.select(folder).await,
        };
        if let Err(e) = selected {
            let _ = session.logout().await;
            return Err(match e {
                ImapError::No(msg) => SyncError::FolderNotFound(format!("{}: {}", folder, msg)),
                other => imap_error(other),
            });
        }
        info!("-- {} selected ({:?})", folder, mode);

        Ok(ImapSession {
            session: Some(session),
            mode,
        })
    }
}

// Establish a TLS-encrypted connection to the IMAP server
async fn connect_to_server(server: &str, port: u16) -> Result<tokio_native_tls::TlsStream<TcpStream>> {
    let connection_error = |e: &dyn fmt::Display| SyncError::Connection(format!("{}:{}: {}", server, port, e));

    let tcp_stream = TcpStream::connect((server, port))
        .await
        .map_err(|e| connection_error(&e))?;
    let connector = native_tls::TlsConnector::new().map_err(|e| connection_error(&e))?;
    let tls_stream = tokio_native_tls::TlsConnector::from(connector)
        .connect(server, tcp_stream)
        .await
        .map_err(|e| connection_error(&e))?;

    info!("-- connected to {}:{}", server, port);
    Ok(tls_stream)
}

// Login to the IMAP server and return an authenticated session
async fn login_to_server(client: Client<ImapStream>, username: &str, password: &str) -> Result<Session<ImapStream>> {
    let imap_session = client
        .login(username, password)
        .await
        .map_err(|(e, _client)| match e {
            ImapError::Io(_) | ImapError::ConnectionLost => imap_error(e),
            other => SyncError::Authentication(format!("{}: {}", username, other)),
        })?;

    info!("-- logged in as {}", username);
    Ok(imap_session)
}

fn imap_error(e: ImapError) -> SyncError {
    match e {
        ImapError::Io(_) | ImapError::ConnectionLost => SyncError::Connection(e.to_string()),
        other => SyncError::Protocol(other.to_string()),
    }
}

pub struct ImapSession {
    session: Option<Session<ImapStream>>,
    mode: AccessMode,
}

impl ImapSession {
    fn live(&mut self) -> Result<&mut Session<ImapStream>> {
        self.session
            .as_mut()
            .ok_or_else(|| SyncError::Protocol("session already closed".to_string()))
    }
}

impl MailboxSession for ImapSession {
    async fn search(&mut self, criterion: &SelectionCriterion) -> Result<Vec<u32>> {
        let uids = self
            .live()?
            .uid_search(criterion.to_imap_query())
            .await
            .map_err(imap_error)?;
        Ok(uids.into_iter().collect())
    }

    async fn fetch_raw(&mut self, uid: u32) -> Result<RawMessage> {
        let query = match self.mode {
            AccessMode::ReadOnly => "(UID BODY.PEEK[])",
            AccessMode::ReadWrite => "(UID RFC822)",
        };
        let session = self.live()?;
        let fetches: Vec<_> = session
            .uid_fetch(uid.to_string(), query)
            .await
            .map_err(imap_error)?
            .try_collect()
            .await
            .map_err(imap_error)?;

        // Servers may interleave unsolicited FETCH responses for other messages.
        let bytes = fetches
            .iter()
            .filter(|fetch| fetch.uid == Some(uid))
            .find_map(|fetch| fetch.body())
            .ok_or_else(|| SyncError::Protocol(format!("no body returned for UID {}", uid)))?;

        Ok(RawMessage {
            uid,
            bytes: bytes.to_vec(),
        })
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            // Be nice to the server and log out
            match session.logout().await {
                Ok(()) => info!("-- logged out"),
                Err(e) => warn!("logout failed: {}", e),
            }
        }
    }
}
