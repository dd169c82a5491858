//! Client-side operation scheduling
//!
//! Owns the directory view and the connection, diffs the local tree
//! against the server listing, and posts CREATE/UPDATE/ERASE/RETRIEVE
//! work. All traffic on the connection flows through one async mutex, so
//! request/response pairs never interleave; per-path state is tracked in
//! the shared view and resolved by the response handlers.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::connection::{Connection, PostOutcome, KEEPALIVE_INTERVAL};
use crate::digest::{file_digest, make_sign, split_sign};
use crate::dir_view::{ClientResource, DirView, SyncState};
use crate::message::{FileMessage, Message, TlvView};
use crate::protocol::{ErrType, MsgType, TlvType, CLIENT_CHUNK_SIZE};

/// Credentials cached for transparent re-authentication after reconnect.
#[derive(Debug, Clone, Default)]
pub struct AuthData {
    pub username: String,
    pub password: String,
    pub authenticated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Create,
    Update,
    Erase,
}

impl OpKind {
    fn msg_type(self) -> MsgType {
        match self {
            OpKind::Create => MsgType::Create,
            OpKind::Update => MsgType::Update,
            OpKind::Erase => MsgType::Erase,
        }
    }

    fn name(self) -> &'static str {
        self.msg_type().as_str()
    }

    /// Error codes equivalent to success: the server already holds what we
    /// were about to send.
    fn acceptable_err(self) -> Option<ErrType> {
        match self {
            OpKind::Create => Some(ErrType::CreateAlreadyExist),
            OpKind::Update => Some(ErrType::UpdateAlreadyUpdated),
            OpKind::Erase => None,
        }
    }
}

enum SyncOutcome {
    Done,
    Lost,
}

pub struct Scheduler {
    dir: Arc<DirView<ClientResource>>,
    conn: tokio::sync::Mutex<Connection>,
    auth_data: Mutex<AuthData>,
}

impl Scheduler {
    pub fn new(dir: Arc<DirView<ClientResource>>, conn: Connection) -> Arc<Self> {
        Arc::new(Self {
            dir,
            conn: tokio::sync::Mutex::new(conn),
            auth_data: Mutex::new(AuthData::default()),
        })
    }

    /// Authenticate with explicit credentials; caches them on success for
    /// replay after a reconnect. `Err` means the connection was lost.
    pub async fn auth_with(&self, username: &str, password: &str) -> Result<bool> {
        let mut request = Message::new(MsgType::Auth);
        request.add_tlv(TlvType::Usrn, username.as_bytes());
        request.add_tlv(TlvType::Pswd, password.as_bytes());
        request.add_tlv(TlvType::End, &[]);

        let outcome = { self.conn.lock().await.post(&request).await };
        match outcome {
            PostOutcome::Disconnected => bail!("connection lost during authentication"),
            PostOutcome::Denied => Ok(false),
            PostOutcome::Reply(response) => {
                let accepted = response
                    .view()
                    .next()
                    .map(|tlv| tlv.tlv_type == TlvType::Ok)
                    .unwrap_or(false);
                if accepted {
                    *self.auth_data.lock() = AuthData {
                        username: username.to_string(),
                        password: password.to_string(),
                        authenticated: true,
                    };
                }
                Ok(accepted)
            }
        }
    }

    /// Interactive login: three rounds of prompting, three attempts per
    /// field. Returns false once attempts are exhausted.
    pub async fn login(&self) -> Result<bool> {
        let mut attempts = 3;
        while attempts > 0 {
            let creds = tokio::task::block_in_place(prompt_credentials);
            let (username, password) = match creds {
                Some(pair) => pair,
                None => return Ok(false),
            };
            if self.auth_with(&username, &password).await? {
                return Ok(true);
            }
            attempts -= 1;
            eprintln!("Authentication failed (attempts left {}).", attempts);
        }
        Ok(false)
    }

    /// Initial reconciliation: fetch the server listing, erase what only
    /// the server has, update what differs, then create what only exists
    /// locally. Retries through reconnection until it completes.
    pub async fn sync(self: &Arc<Self>) -> Result<()> {
        loop {
            let observed_gen = { self.conn.lock().await.generation() };
            match self.sync_once().await? {
                SyncOutcome::Done => return Ok(()),
                SyncOutcome::Lost => {
                    self.reestablish(observed_gen).await?;
                }
            }
        }
    }

    async fn sync_once(self: &Arc<Self>) -> Result<SyncOutcome> {
        let mut request = Message::new(MsgType::List);
        request.add_tlv(TlvType::End, &[]);
        println!("scheduling SYNC...");

        let outcome = { self.conn.lock().await.post(&request).await };
        let response = match outcome {
            PostOutcome::Disconnected => return Ok(SyncOutcome::Lost),
            PostOutcome::Denied => bail!("failed to obtain server file list"),
            PostOutcome::Reply(msg) => msg,
        };
        if response.msg_type() != MsgType::List {
            bail!("unexpected reply type to LIST");
        }
        let mut view = response.view();
        let first = view.next().context("empty LIST response")?;
        if first.tlv_type == TlvType::Error {
            // a rejection means this session already served its listing
            // (a concurrent recovery got there first) - nothing to do
            if ErrType::parse(first.value) == Some(ErrType::MsgTypeRejected) {
                return Ok(SyncOutcome::Done);
            }
            bail!(
                "server failed to produce the listing ({})",
                ErrType::parse(first.value).map(|e| e.as_str()).unwrap_or("?")
            );
        }

        // server-side listing as a temporary map, then two diff passes
        let mut server_tree: HashMap<PathBuf, String> = HashMap::new();
        let mut record = Some(first);
        while let Some(tlv) = record {
            if tlv.tlv_type == TlvType::Item {
                let sign = tlv.value_str().context("non-utf8 sign in listing")?;
                let (relative_path, s_digest) = split_sign(sign)?;
                server_tree.insert(relative_path.clone(), s_digest.clone());

                match self.dir.rsrc(&relative_path) {
                    None => self.erase(&relative_path, &s_digest),
                    Some(rsrc) => {
                        if rsrc.digest != s_digest {
                            let c_digest = rsrc.digest.clone();
                            self.update(&relative_path, &c_digest);
                        } else {
                            self.dir.insert_or_assign(
                                &relative_path,
                                rsrc.with_synced(SyncState::Synced).with_exists_on_server(true),
                            );
                        }
                    }
                }
            }
            record = view.next();
        }

        for (relative_path, rsrc) in self.dir.snapshot() {
            if !server_tree.contains_key(&relative_path) {
                self.create(&relative_path, &rsrc.digest);
            }
        }
        println!("SYNC done.");
        Ok(SyncOutcome::Done)
    }

    /// Schedule a CREATE for a local file.
    pub fn create(self: &Arc<Self>, relative_path: &Path, digest: &str) {
        self.spawn_op(OpKind::Create, relative_path, digest, false);
    }

    /// Schedule an UPDATE for a changed local file.
    pub fn update(self: &Arc<Self>, relative_path: &Path, digest: &str) {
        self.spawn_op(OpKind::Update, relative_path, digest, true);
    }

    /// Schedule an ERASE for a path the server should forget.
    pub fn erase(self: &Arc<Self>, relative_path: &Path, digest: &str) {
        self.spawn_op(OpKind::Erase, relative_path, digest, true);
    }

    fn spawn_op(self: &Arc<Self>, op: OpKind, relative_path: &Path, digest: &str, on_server: bool) {
        let sched = self.clone();
        let relative_path = relative_path.to_path_buf();
        let digest = digest.to_string();
        tokio::spawn(async move {
            println!("scheduling {} for {}...", op.name(), relative_path.display());
            sched.dir.insert_or_assign(
                &relative_path,
                ClientResource::new(SyncState::Pending, on_server, digest.clone()),
            );
            let sign = make_sign(&relative_path, &digest);

            let (outcome, observed_gen) = match op {
                OpKind::Erase => {
                    let mut request = Message::new(MsgType::Erase);
                    request.add_tlv(TlvType::Item, sign.as_bytes());
                    request.add_tlv(TlvType::End, &[]);
                    let mut conn = sched.conn.lock().await;
                    let gen = conn.generation();
                    (conn.post(&request).await, gen)
                }
                OpKind::Create | OpKind::Update => {
                    let absolute_path = sched.dir.path().join(&relative_path);
                    let mut f_msg = match FileMessage::open(
                        op.msg_type(),
                        &absolute_path,
                        &sign,
                        CLIENT_CHUNK_SIZE,
                    ) {
                        Ok(f_msg) => f_msg,
                        Err(e) => {
                            eprintln!("{} on {} failed: {}", op.name(), relative_path.display(), e);
                            sched.mark_desynced(&relative_path);
                            return;
                        }
                    };
                    let mut conn = sched.conn.lock().await;
                    let gen = conn.generation();
                    (conn.post_file(&mut f_msg).await, gen)
                }
            };
            sched.integrate_response(op, &relative_path, &sign, outcome, observed_gen);
        });
    }

    fn mark_desynced(&self, relative_path: &Path) {
        if let Some(rsrc) = self.dir.rsrc(relative_path) {
            self.dir
                .insert_or_assign(relative_path, rsrc.with_synced(SyncState::Desynced));
        }
    }

    /// Fold one operation's reply back into the view. A valid reply echoes
    /// the request's type and sign, then carries OK or a tolerated ERROR.
    fn integrate_response(
        self: &Arc<Self>,
        op: OpKind,
        relative_path: &Path,
        sign: &str,
        outcome: PostOutcome,
        observed_gen: u64,
    ) {
        let rsrc = match self.dir.rsrc(relative_path) {
            Some(rsrc) => rsrc,
            None => return,
        };
        let response = match outcome {
            PostOutcome::Reply(msg) => msg,
            PostOutcome::Denied => {
                println!("{} on {} failed, will retry", op.name(), relative_path.display());
                self.mark_desynced(relative_path);
                return;
            }
            PostOutcome::Disconnected => {
                self.mark_desynced(relative_path);
                self.spawn_recover(observed_gen);
                return;
            }
        };

        let accepted = response.msg_type() == op.msg_type()
            && response_confirms(response.view(), sign, op.acceptable_err());
        if accepted {
            println!("{} on {} done", op.name(), relative_path.display());
            match op {
                OpKind::Create => self.dir.insert_or_assign(
                    relative_path,
                    rsrc.with_synced(SyncState::Synced).with_exists_on_server(true),
                ),
                OpKind::Update => self
                    .dir
                    .insert_or_assign(relative_path, rsrc.with_synced(SyncState::Synced)),
                OpKind::Erase => {
                    self.dir.erase(relative_path);
                }
            }
        } else {
            println!("{} on {} failed, will retry", op.name(), relative_path.display());
            self.mark_desynced(relative_path);
        }
    }

    /// Probe the connection after 30 s of silence. Returns false when the
    /// probe did not get an OK back (recovery is kicked off internally on
    /// connection loss).
    pub async fn keep_alive(self: &Arc<Self>) -> bool {
        let mut request = Message::new(MsgType::KeepAlive);
        request.add_tlv(TlvType::End, &[]);
        let (outcome, observed_gen) = {
            let mut conn = self.conn.lock().await;
            let gen = conn.generation();
            (conn.post(&request).await, gen)
        };
        match outcome {
            PostOutcome::Reply(response) => response
                .view()
                .next()
                .map(|tlv| tlv.tlv_type == TlvType::Ok)
                .unwrap_or(false),
            PostOutcome::Denied => false,
            PostOutcome::Disconnected => {
                self.spawn_recover(observed_gen);
                false
            }
        }
    }

    /// Background task: when the keepalive deadline elapses with no
    /// traffic, post a KEEP_ALIVE probe.
    pub fn spawn_keepalive(self: &Arc<Self>) {
        let sched = self.clone();
        tokio::spawn(async move {
            loop {
                let deadline = { sched.conn.lock().await.keepalive_deadline() };
                tokio::time::sleep_until(deadline).await;
                let due = {
                    sched.conn.lock().await.keepalive_deadline() <= tokio::time::Instant::now()
                };
                if due && !sched.keep_alive().await {
                    // a failed probe leaves the deadline in the past; wait a
                    // full interval before probing again
                    tokio::time::sleep(KEEPALIVE_INTERVAL).await;
                }
            }
        });
    }

    fn spawn_recover(self: &Arc<Self>, observed_gen: u64) {
        let sched = self.clone();
        tokio::spawn(async move {
            if let Err(e) = sched.recover(observed_gen).await {
                eprintln!("reconnection failed: {}", e);
                std::process::exit(1);
            }
        });
    }

    /// Full recovery cycle after a lost connection: re-open the stream,
    /// replay authentication, re-run the initial sync. When another task
    /// already reconnected, that task owns the resync and this one is done.
    async fn recover(self: &Arc<Self>, observed_gen: u64) -> Result<()> {
        if self.reestablish(observed_gen).await? && self.auth_data.lock().authenticated {
            self.sync().await?;
        }
        Ok(())
    }

    /// Reconnect the stream (first caller wins; later callers observe a
    /// newer generation and back off) and replay cached credentials,
    /// falling back to interactive login. Returns whether this caller did
    /// the reconnecting.
    async fn reestablish(self: &Arc<Self>, observed_gen: u64) -> Result<bool> {
        {
            let mut conn = self.conn.lock().await;
            if conn.generation() != observed_gen {
                return Ok(false);
            }
            eprintln!("connection to the server has been lost, reconnecting...");
            conn.connect().await?;
        }
        let auth = self.auth_data.lock().clone();
        if auth.authenticated && !self.auth_with(&auth.username, &auth.password).await? {
            if !self.login().await? {
                bail!("authentication failed after reconnect");
            }
        }
        Ok(true)
    }

    /// Full-tree restore: list the server's files, then retrieve each one
    /// into the local root.
    pub async fn restore(self: &Arc<Self>) -> Result<()> {
        let mut request = Message::new(MsgType::List);
        request.add_tlv(TlvType::End, &[]);
        println!("scheduling RESTORE...");

        let outcome = { self.conn.lock().await.post(&request).await };
        let response = match outcome {
            PostOutcome::Reply(msg) => msg,
            _ => bail!("failed to obtain server file list"),
        };
        if response.msg_type() != MsgType::List {
            bail!("unexpected reply type to LIST");
        }
        let mut view = response.view();
        let first = view.next().context("empty LIST response")?;
        if first.tlv_type == TlvType::Error {
            bail!("RESTORE failed");
        }
        let mut record = Some(first);
        while let Some(tlv) = record {
            if tlv.tlv_type == TlvType::Item {
                if let Some(sign) = tlv.value_str() {
                    self.retrieve(sign).await;
                }
            }
            record = view.next();
        }
        println!("RESTORE done.");
        Ok(())
    }

    /// Download one file version and verify it against its sign. The file
    /// is removed again when the received bytes do not match.
    pub async fn retrieve(self: &Arc<Self>, sign: &str) -> bool {
        let (relative_path, digest) = match split_sign(sign) {
            Ok(parts) => parts,
            Err(_) => return false,
        };
        println!("scheduling RETRIEVE for {}...", relative_path.display());

        let mut request = Message::new(MsgType::Retrieve);
        request.add_tlv(TlvType::Item, sign.as_bytes());
        request.add_tlv(TlvType::End, &[]);
        let outcome = { self.conn.lock().await.post(&request).await };
        let response = match outcome {
            PostOutcome::Reply(msg) if msg.msg_type() == MsgType::Retrieve => msg,
            _ => {
                println!("RETRIEVE on {} failed", relative_path.display());
                return false;
            }
        };

        let bytes = match collect_chunks(response.view(), sign) {
            Some(bytes) => bytes,
            None => {
                println!("RETRIEVE on {} failed", relative_path.display());
                return false;
            }
        };

        let absolute_path = self.dir.path().join(&relative_path);
        let write = || -> Result<()> {
            if let Some(parent) = absolute_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::File::create(&absolute_path)?;
            file.write_all(&bytes)?;
            Ok(())
        };
        if write().is_err() {
            println!("RETRIEVE on {} failed", relative_path.display());
            return false;
        }

        match file_digest(&absolute_path, &relative_path) {
            Ok(got) if got == digest => {
                println!("RETRIEVE on {} done", relative_path.display());
                true
            }
            _ => {
                std::fs::remove_file(&absolute_path).ok();
                println!("RETRIEVE on {} failed", relative_path.display());
                false
            }
        }
    }
}

/// Check a reply body: ITEM echoing `sign`, then OK (or a tolerated error
/// code).
fn response_confirms(mut view: TlvView<'_>, sign: &str, acceptable: Option<ErrType>) -> bool {
    match view.next() {
        Some(tlv) if tlv.tlv_type == TlvType::Item && tlv.value == sign.as_bytes() => {}
        _ => return false,
    }
    match view.next() {
        Some(tlv) if tlv.tlv_type == TlvType::Ok => true,
        Some(tlv) if tlv.tlv_type == TlvType::Error => {
            matches!((ErrType::parse(tlv.value), acceptable), (Some(err), Some(ok)) if err == ok)
        }
        _ => false,
    }
}

/// Walk a RETRIEVE reply: `(ITEM(sign), CONTENT)*` then END. Returns the
/// concatenated content, or `None` on any deviation.
fn collect_chunks(mut view: TlvView<'_>, sign: &str) -> Option<Vec<u8>> {
    let mut bytes = Vec::new();
    loop {
        match view.next() {
            Some(tlv) if tlv.tlv_type == TlvType::Item && tlv.value == sign.as_bytes() => {
                match view.next() {
                    Some(content) if content.tlv_type == TlvType::Content => {
                        bytes.extend_from_slice(content.value);
                    }
                    _ => return None,
                }
            }
            Some(tlv) if tlv.tlv_type == TlvType::End => return Some(bytes),
            _ => return None,
        }
    }
}

fn valid_username(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.')
}

fn valid_password(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || ".@$!%*?&-".contains(c))
}

fn prompt_field(prompt: &str, valid: fn(&str) -> bool) -> Option<String> {
    let mut attempts = 3;
    loop {
        println!("{}", prompt);
        let mut line = String::new();
        let ok = std::io::stdin().read_line(&mut line).is_ok();
        let value = line.trim();
        if ok && valid(value) {
            return Some(value.to_string());
        }
        attempts -= 1;
        println!("Invalid input. Try again (attempts left {}).", attempts);
        if attempts == 0 {
            return None;
        }
    }
}

fn prompt_credentials() -> Option<(String, String)> {
    let username = prompt_field("Insert your username:", valid_username)?;
    let password = prompt_field("Insert your password:", valid_password)?;
    Some((username, password))
}
