use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::protocol::{ErrType, MsgType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRes {
    Ok,
    Err,
}

impl ConnRes {
    fn as_str(self) -> &'static str {
        match self {
            ConnRes::Ok => "OK",
            ConnRes::Err => "ERR",
        }
    }
}

/// Append-only request log. One writer per line; lines are
/// `[ISO-8601 UTC][user@ip][...]`.
pub struct Logger {
    file: Mutex<File>,
}

impl Logger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(f) })
    }

    fn line(&self, who: &str, what: &str) {
        if let Ok(mut f) = self.file.lock() {
            let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            let _ = writeln!(f, "[{}][{}][{}]", ts, who, what);
        }
    }

    fn who(username: &str, ip: &str) -> String {
        if username.is_empty() {
            ip.to_string()
        } else {
            format!("{}@{}", username, ip)
        }
    }

    /// Free-text event (accept, shutdown, handshake failure).
    pub fn event(&self, username: &str, ip: &str, message: &str) {
        self.line(&Self::who(username, ip), message);
    }

    /// One request/response cycle's outcome.
    pub fn request(
        &self,
        username: &str,
        ip: &str,
        msg_type: MsgType,
        err_type: ErrType,
        conn_res: ConnRes,
    ) {
        self.line(
            &Self::who(username, ip),
            &format!(
                "TYPE: {} RES: {} CONN: {}",
                msg_type.as_str(),
                err_type.as_str(),
                conn_res.as_str()
            ),
        );
    }
}
