//! Server-side request dispatch
//!
//! Decodes one request message, mutates the session, and produces a reply
//! queue. The state machine gates operations on (authenticated, listed):
//! AUTH first, then exactly one LIST, then mutations and retrievals.

use anyhow::{bail, Result};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::digest;
use crate::dir_view::ServerResource;
use crate::message::{FileMessage, Message, MessageQueue, Tlv, TlvView};
use crate::protocol::{ErrType, MsgType, TlvType, SERVER_CHUNK_SIZE};
use crate::session::{OpenStreams, UserSession};

/// Placeholder digest stored while a multi-chunk transfer is in flight.
const TEMP_DIGEST: &str = "TEMP";

pub struct RequestHandler {
    backup_root: PathBuf,
    credentials_path: PathBuf,
    streams: OpenStreams,
}

/// Join a sign's relative path under the user root, rejecting any
/// component that could escape it.
fn safe_join(root: &Path, relative: &Path) -> Result<PathBuf> {
    let mut joined = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(s) => joined.push(s),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("path {:?} contains disallowed component", relative);
            }
        }
    }
    if joined == root {
        bail!("empty relative path");
    }
    Ok(joined)
}

fn fatal_fs(context: &str, err: std::io::Error) -> ! {
    eprintln!("fatal filesystem error ({}): {}", context, err);
    std::process::exit(1);
}

/// Extract `(sign, relative path, digest)` from an ITEM record.
fn parse_item(item: &Tlv<'_>) -> Option<(String, PathBuf, String)> {
    let sign = item.value_str()?.to_string();
    let (relative_path, digest) = digest::split_sign(&sign).ok()?;
    Some((sign, relative_path, digest))
}

impl RequestHandler {
    pub fn new(backup_root: PathBuf, credentials_path: PathBuf) -> Self {
        Self { backup_root, credentials_path, streams: OpenStreams::new() }
    }

    pub fn streams(&self) -> &OpenStreams {
        &self.streams
    }

    /// Serve one decoded request. Every reply queue is terminated by an END
    /// record; an ERROR record always precedes the END of its frame.
    pub fn handle_request(&self, request: &Message, user: &mut UserSession) -> MessageQueue {
        let msg_type = request.msg_type();
        let mut replies = MessageQueue::new(msg_type);
        let mut view = request.view();
        let first = match view.next() {
            Some(tlv) => tlv,
            None => {
                replies.close(ErrType::NoContent);
                return replies;
            }
        };

        if !user.authenticated() {
            match msg_type {
                MsgType::Auth => self.handle_auth(first, &mut view, &mut replies, user),
                _ => replies.close(ErrType::MsgTypeRejected),
            }
        } else if !user.listed() {
            match msg_type {
                MsgType::List => self.handle_list(&mut replies, user),
                _ => replies.close(ErrType::MsgTypeRejected),
            }
        } else {
            match msg_type {
                MsgType::Create => {
                    self.handle_create(first, &mut view, request, &mut replies, user)
                }
                MsgType::Update => {
                    self.handle_update(first, &mut view, request, &mut replies, user)
                }
                MsgType::Erase => self.handle_erase(first, &mut replies, user),
                MsgType::Retrieve => replies = self.handle_retrieve(first, user),
                MsgType::KeepAlive => replies.close(ErrType::None),
                _ => replies.close(ErrType::MsgTypeRejected),
            }
        }
        replies
    }

    fn handle_auth(
        &self,
        first: Tlv<'_>,
        view: &mut TlvView<'_>,
        replies: &mut MessageQueue,
        user: &mut UserSession,
    ) {
        let username = match (first.tlv_type, first.value_str()) {
            (TlvType::Usrn, Some(u)) => u.to_string(),
            _ => return replies.close(ErrType::AuthNoUsrn),
        };
        let password = match view.next() {
            Some(tlv) if tlv.tlv_type == TlvType::Pswd => match tlv.value_str() {
                Some(p) => p.to_string(),
                None => return replies.close(ErrType::AuthNoPswd),
            },
            _ => return replies.close(ErrType::AuthNoPswd),
        };

        if !digest::verify_password(&self.credentials_path, &username, &password) {
            return replies.close(ErrType::AuthFailed);
        }
        let user_id = digest::string_digest(&username);
        let dir_root = self.backup_root.join(&user_id);
        // first login of a new user starts from an empty tree
        if std::fs::create_dir_all(&dir_root).is_err() {
            return replies.close(ErrType::AuthFailed);
        }
        user.authenticate(user_id, username, dir_root);
        replies.close(ErrType::None);
    }

    fn handle_list(&self, replies: &mut MessageQueue, user: &mut UserSession) {
        let user_dir = user.dir().expect("authenticated session has a dir").clone();
        let root = user_dir.path().to_path_buf();

        let mut walk = || -> Result<()> {
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let absolute_path = entry.path();
                let relative_path = absolute_path.strip_prefix(&root)?;
                let file_digest = digest::file_digest(absolute_path, relative_path)?;
                user_dir.insert_or_assign(
                    relative_path,
                    ServerResource::new(true, file_digest.clone()),
                );
                let sign = digest::make_sign(relative_path, &file_digest);
                replies.add_tlv(TlvType::Item, sign.as_bytes());
            }
            Ok(())
        };

        match walk() {
            Ok(()) => {
                user.set_listed(true);
                replies.close(ErrType::None);
            }
            Err(e) => {
                eprintln!("LIST walk failed for {}: {}", root.display(), e);
                user_dir.clear();
                *replies = MessageQueue::new(MsgType::List);
                replies.close(ErrType::ListFailed);
            }
        }
    }

    fn handle_create(
        &self,
        first: Tlv<'_>,
        view: &mut TlvView<'_>,
        request: &Message,
        replies: &mut MessageQueue,
        user: &mut UserSession,
    ) {
        if first.tlv_type != TlvType::Item {
            return replies.close(ErrType::CreateNoItem);
        }
        let (sign, relative_path, c_digest) = match parse_item(&first) {
            Some(parts) => parts,
            None => return replies.close(ErrType::CreateNoItem),
        };
        let user_dir = user.dir().expect("listed session has a dir").clone();
        replies.add_tlv(TlvType::Item, sign.as_bytes());

        let content = match view.next() {
            Some(tlv) if tlv.tlv_type == TlvType::Content => tlv,
            _ => return replies.close(ErrType::CreateNoContent),
        };

        if let Some(rsrc) = user_dir.rsrc(&relative_path) {
            if rsrc.synced {
                return replies.close(ErrType::CreateAlreadyExist);
            }
        }

        let absolute_path = match safe_join(user_dir.path(), &relative_path) {
            Ok(p) => p,
            Err(_) => return replies.close(ErrType::CreateFailed),
        };
        if let Some(parent) = absolute_path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return replies.close(ErrType::CreateFailed);
            }
        }

        let is_last = request.verify_end();
        let is_first = match self.write_chunk(user.id(), &absolute_path, content.value) {
            Ok(first_chunk) => first_chunk,
            Err(e) => {
                eprintln!("CREATE write failed for {}: {}", absolute_path.display(), e);
                return replies.close(ErrType::CreateFailed);
            }
        };

        if is_first {
            user_dir.insert_or_assign(
                &relative_path,
                ServerResource::new(
                    is_last,
                    if is_last { c_digest.clone() } else { TEMP_DIGEST.to_string() },
                ),
            );
        } else if is_last {
            user_dir.insert_or_assign(&relative_path, ServerResource::new(true, c_digest.clone()));
        }

        if is_last {
            self.streams.erase_stream(user.id());
            match digest::file_digest(&absolute_path, &relative_path) {
                Ok(s_digest) if s_digest == c_digest => {}
                outcome => {
                    if let Err(e) = std::fs::remove_file(&absolute_path) {
                        fatal_fs("remove mismatched create", e);
                    }
                    user_dir.erase(&relative_path);
                    let err = match outcome {
                        Ok(_) => ErrType::CreateNoMatch,
                        Err(_) => ErrType::CreateFailed,
                    };
                    return replies.close(err);
                }
            }
        }
        replies.close(ErrType::None);
    }

    fn handle_update(
        &self,
        first: Tlv<'_>,
        view: &mut TlvView<'_>,
        request: &Message,
        replies: &mut MessageQueue,
        user: &mut UserSession,
    ) {
        if first.tlv_type != TlvType::Item {
            return replies.close(ErrType::UpdateNoItem);
        }
        let (sign, relative_path, c_digest) = match parse_item(&first) {
            Some(parts) => parts,
            None => return replies.close(ErrType::UpdateNoItem),
        };
        let user_dir = user.dir().expect("listed session has a dir").clone();
        replies.add_tlv(TlvType::Item, sign.as_bytes());

        let content = match view.next() {
            Some(tlv) if tlv.tlv_type == TlvType::Content => tlv,
            _ => return replies.close(ErrType::UpdateNoContent),
        };

        let rsrc = match user_dir.rsrc(&relative_path) {
            Some(rsrc) => rsrc,
            None => return replies.close(ErrType::UpdateNotExist),
        };
        if rsrc.digest == c_digest {
            return replies.close(ErrType::UpdateAlreadyUpdated);
        }

        let absolute_path = match safe_join(user_dir.path(), &relative_path) {
            Ok(p) => p,
            Err(_) => return replies.close(ErrType::UpdateFailed),
        };
        let mut temp_path = absolute_path.clone().into_os_string();
        temp_path.push(".temp");
        let temp_path = PathBuf::from(temp_path);

        let is_last = request.verify_end();
        let is_first = match self.write_chunk(user.id(), &temp_path, content.value) {
            Ok(first_chunk) => first_chunk,
            Err(e) => {
                eprintln!("UPDATE write failed for {}: {}", temp_path.display(), e);
                return replies.close(ErrType::UpdateFailed);
            }
        };

        if is_first {
            user_dir.insert_or_assign(
                &relative_path,
                ServerResource::new(
                    is_last,
                    if is_last { c_digest.clone() } else { rsrc.digest.clone() },
                ),
            );
        } else if is_last {
            user_dir.insert_or_assign(&relative_path, ServerResource::new(true, c_digest.clone()));
        }

        if is_last {
            self.streams.erase_stream(user.id());
            // atomic swap: the original bytes stay visible until the rename
            if let Err(e) = std::fs::remove_file(&absolute_path) {
                fatal_fs("remove before update swap", e);
            }
            if let Err(e) = std::fs::rename(&temp_path, &absolute_path) {
                fatal_fs("rename update temp", e);
            }
            match digest::file_digest(&absolute_path, &relative_path) {
                Ok(s_digest) if s_digest == c_digest => {}
                outcome => {
                    if let Err(e) = std::fs::remove_file(&absolute_path) {
                        fatal_fs("remove mismatched update", e);
                    }
                    user_dir.erase(&relative_path);
                    let err = match outcome {
                        Ok(_) => ErrType::UpdateNoMatch,
                        Err(_) => ErrType::UpdateFailed,
                    };
                    return replies.close(err);
                }
            }
        }
        replies.close(ErrType::None);
    }

    fn handle_erase(&self, first: Tlv<'_>, replies: &mut MessageQueue, user: &mut UserSession) {
        if first.tlv_type != TlvType::Item {
            return replies.close(ErrType::EraseNoItem);
        }
        let (sign, relative_path, c_digest) = match parse_item(&first) {
            Some(parts) => parts,
            None => return replies.close(ErrType::EraseNoItem),
        };
        let user_dir = user.dir().expect("listed session has a dir").clone();
        replies.add_tlv(TlvType::Item, sign.as_bytes());

        match user_dir.rsrc(&relative_path) {
            Some(rsrc) if rsrc.digest == c_digest => {}
            _ => return replies.close(ErrType::EraseNoMatch),
        }

        let absolute_path = match safe_join(user_dir.path(), &relative_path) {
            Ok(p) => p,
            Err(_) => return replies.close(ErrType::EraseFailed),
        };
        if std::fs::remove_file(&absolute_path).is_err() {
            return replies.close(ErrType::EraseFailed);
        }
        user_dir.erase(&relative_path);
        replies.close(ErrType::None);

        // prune ancestors the deletion emptied, up to (not including) the root
        let mut current = absolute_path.parent().map(Path::to_path_buf);
        while let Some(dir) = current {
            if dir == user_dir.path() {
                break;
            }
            let empty = match std::fs::read_dir(&dir) {
                Ok(mut it) => it.next().is_none(),
                Err(_) => break,
            };
            if !empty || std::fs::remove_dir(&dir).is_err() {
                break;
            }
            current = dir.parent().map(Path::to_path_buf);
        }
    }

    fn handle_retrieve(&self, first: Tlv<'_>, user: &mut UserSession) -> MessageQueue {
        let mut replies = MessageQueue::new(MsgType::Retrieve);
        if first.tlv_type != TlvType::Item {
            replies.close(ErrType::RetrieveFailed);
            return replies;
        }
        let (sign, relative_path, _) = match parse_item(&first) {
            Some(parts) => parts,
            None => {
                replies.close(ErrType::RetrieveFailed);
                return replies;
            }
        };
        let user_dir = user.dir().expect("listed session has a dir").clone();

        let mut stream = || -> Result<MessageQueue> {
            let absolute_path = safe_join(user_dir.path(), &relative_path)?;
            let mut queue = MessageQueue::new(MsgType::Retrieve);
            let mut f_msg =
                FileMessage::open(MsgType::Retrieve, &absolute_path, &sign, SERVER_CHUNK_SIZE)?;
            while let Some(chunk) = f_msg.next_chunk()? {
                queue.add_message(chunk);
            }
            Ok(queue)
        };

        match stream() {
            Ok(queue) => queue,
            Err(e) => {
                eprintln!("RETRIEVE failed for {}: {}", relative_path.display(), e);
                let mut queue = MessageQueue::new(MsgType::Retrieve);
                queue.close(ErrType::RetrieveFailed);
                queue
            }
        }
    }

    fn write_chunk(&self, user_id: &str, path: &Path, chunk: &[u8]) -> Result<bool> {
        use std::io::Write;
        let (file, is_first) = self.streams.get_stream(user_id, path)?;
        let mut file = file.lock();
        file.write_all(chunk)?;
        file.flush()?;
        Ok(is_first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{file_digest, make_sign, sha512_hex, string_digest};
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        handler: RequestHandler,
        user: UserSession,
        backup_root: PathBuf,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let backup_root = root.path().join("backup");
        fs::create_dir_all(&backup_root).unwrap();
        let credentials = root.path().join("credentials");
        let mut f = fs::File::create(&credentials).unwrap();
        writeln!(f, "alice\t{}", sha512_hex("wonderland")).unwrap();
        drop(f);
        Fixture {
            handler: RequestHandler::new(backup_root.clone(), credentials),
            user: UserSession::new("127.0.0.1".into()),
            backup_root,
            _root: root,
        }
    }

    fn auth_msg(username: &str, password: &str) -> Message {
        let mut msg = Message::new(MsgType::Auth);
        msg.add_tlv(TlvType::Usrn, username.as_bytes());
        msg.add_tlv(TlvType::Pswd, password.as_bytes());
        msg.add_tlv(TlvType::End, &[]);
        msg
    }

    fn list_msg() -> Message {
        let mut msg = Message::new(MsgType::List);
        msg.add_tlv(TlvType::End, &[]);
        msg
    }

    fn single_chunk(msg_type: MsgType, sign: &str, content: &[u8]) -> Message {
        let mut msg = Message::new(msg_type);
        msg.add_tlv(TlvType::Item, sign.as_bytes());
        msg.add_tlv(TlvType::Content, content);
        msg.add_tlv(TlvType::End, &[]);
        msg
    }

    fn reply_records(q: &mut MessageQueue) -> Vec<(TlvType, Vec<u8>)> {
        let mut records = Vec::new();
        while let Some(frame) = q.pop_front() {
            for tlv in frame.view() {
                records.push((tlv.tlv_type, tlv.value.to_vec()));
            }
        }
        records
    }

    fn login_and_list(fx: &mut Fixture) {
        let mut q = fx.handler.handle_request(&auth_msg("alice", "wonderland"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);
        drop(reply_records(&mut q));
        let mut q = fx.handler.handle_request(&list_msg(), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);
        drop(reply_records(&mut q));
        assert!(fx.user.listed());
    }

    fn sign_for(content: &[u8], relative: &str) -> (String, String) {
        // digest over path || bytes, same formula as the client
        let mut ctx = md5::Context::new();
        ctx.consume(relative.as_bytes());
        ctx.consume(content);
        let digest = format!("{:x}", ctx.compute());
        (make_sign(Path::new(relative), &digest), digest)
    }

    #[test]
    fn rejects_everything_before_auth() {
        let mut fx = fixture();
        let mut q = fx.handler.handle_request(&list_msg(), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::MsgTypeRejected);
        let frame = q.pop_front().unwrap();
        assert!(frame.verify_end());
    }

    #[test]
    fn rejects_mutations_before_list() {
        let mut fx = fixture();
        let q = fx.handler.handle_request(&auth_msg("alice", "wonderland"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);
        let (sign, _) = sign_for(b"x", "a.txt");
        let q = fx
            .handler
            .handle_request(&single_chunk(MsgType::Create, &sign, b"x"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::MsgTypeRejected);
    }

    #[test]
    fn auth_failures_carry_specific_codes() {
        let mut fx = fixture();
        let q = fx.handler.handle_request(&auth_msg("alice", "nope"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::AuthFailed);
        assert!(!fx.user.authenticated());

        let mut missing_pswd = Message::new(MsgType::Auth);
        missing_pswd.add_tlv(TlvType::Usrn, b"alice");
        missing_pswd.add_tlv(TlvType::End, &[]);
        let q = fx.handler.handle_request(&missing_pswd, &mut fx.user);
        assert_eq!(q.err_type(), ErrType::AuthNoPswd);

        let mut missing_usrn = Message::new(MsgType::Auth);
        missing_usrn.add_tlv(TlvType::Pswd, b"wonderland");
        missing_usrn.add_tlv(TlvType::End, &[]);
        let q = fx.handler.handle_request(&missing_usrn, &mut fx.user);
        assert_eq!(q.err_type(), ErrType::AuthNoUsrn);
    }

    #[test]
    fn empty_request_yields_no_content() {
        let mut fx = fixture();
        let msg = Message::new(MsgType::Auth);
        let q = fx.handler.handle_request(&msg, &mut fx.user);
        assert_eq!(q.err_type(), ErrType::NoContent);
    }

    #[test]
    fn auth_binds_user_directory() {
        let mut fx = fixture();
        let q = fx.handler.handle_request(&auth_msg("alice", "wonderland"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);
        let expected = fx.backup_root.join(string_digest("alice"));
        assert_eq!(fx.user.dir().unwrap().path(), expected);
        assert!(expected.is_dir());
    }

    #[test]
    fn list_reports_existing_tree() {
        let mut fx = fixture();
        let user_root = fx.backup_root.join(string_digest("alice"));
        fs::create_dir_all(user_root.join("d")).unwrap();
        fs::write(user_root.join("d/old.txt"), b"kept bytes").unwrap();

        let q = fx.handler.handle_request(&auth_msg("alice", "wonderland"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);
        let mut q = fx.handler.handle_request(&list_msg(), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);
        let records = reply_records(&mut q);
        let items: Vec<_> = records.iter().filter(|(t, _)| *t == TlvType::Item).collect();
        assert_eq!(items.len(), 1);
        let sign = String::from_utf8(items[0].1.clone()).unwrap();
        assert!(sign.starts_with("d/old.txt\x00"));
        assert!(fx.user.dir().unwrap().contains(Path::new("d/old.txt")));
    }

    #[test]
    fn create_writes_file_and_echoes_sign() {
        let mut fx = fixture();
        login_and_list(&mut fx);
        let (sign, digest) = sign_for(b"hello", "a.txt");
        let mut q = fx
            .handler
            .handle_request(&single_chunk(MsgType::Create, &sign, b"hello"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);
        let records = reply_records(&mut q);
        assert_eq!(records[0].0, TlvType::Item);
        assert_eq!(records[0].1, sign.as_bytes());
        assert_eq!(records[1].0, TlvType::Ok);
        assert_eq!(records.last().unwrap().0, TlvType::End);

        let on_disk = fx.user.dir().unwrap().path().join("a.txt");
        assert_eq!(fs::read(&on_disk).unwrap(), b"hello");
        let rsrc = fx.user.dir().unwrap().rsrc(Path::new("a.txt")).unwrap();
        assert!(rsrc.synced);
        assert_eq!(rsrc.digest, digest);
    }

    #[test]
    fn create_twice_reports_already_exist() {
        let mut fx = fixture();
        login_and_list(&mut fx);
        let (sign, _) = sign_for(b"hello", "a.txt");
        let q = fx
            .handler
            .handle_request(&single_chunk(MsgType::Create, &sign, b"hello"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);
        let q = fx
            .handler
            .handle_request(&single_chunk(MsgType::Create, &sign, b"hello"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::CreateAlreadyExist);
        // idempotence: the stored state is unchanged
        assert_eq!(
            fs::read(fx.user.dir().unwrap().path().join("a.txt")).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn create_digest_mismatch_removes_file() {
        let mut fx = fixture();
        login_and_list(&mut fx);
        let sign = make_sign(Path::new("a.txt"), "00000000000000000000000000000000");
        let q = fx
            .handler
            .handle_request(&single_chunk(MsgType::Create, &sign, b"hello"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::CreateNoMatch);
        assert!(!fx.user.dir().unwrap().path().join("a.txt").exists());
        assert!(!fx.user.dir().unwrap().contains(Path::new("a.txt")));
    }

    #[test]
    fn create_multi_chunk_uses_temp_placeholder() {
        let mut fx = fixture();
        login_and_list(&mut fx);
        let full = b"first-halfsecond-half".to_vec();
        let (sign, digest) = sign_for(&full, "big.bin");

        // first chunk: no END record yet
        let mut chunk1 = Message::new(MsgType::Create);
        chunk1.add_tlv(TlvType::Item, sign.as_bytes());
        chunk1.add_tlv(TlvType::Content, b"first-half");
        let q = fx.handler.handle_request(&chunk1, &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);
        let rsrc = fx.user.dir().unwrap().rsrc(Path::new("big.bin")).unwrap();
        assert!(!rsrc.synced);
        assert_eq!(rsrc.digest, TEMP_DIGEST);

        let q = fx
            .handler
            .handle_request(&single_chunk(MsgType::Create, &sign, b"second-half"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);
        let rsrc = fx.user.dir().unwrap().rsrc(Path::new("big.bin")).unwrap();
        assert!(rsrc.synced);
        assert_eq!(rsrc.digest, digest);
        assert_eq!(
            fs::read(fx.user.dir().unwrap().path().join("big.bin")).unwrap(),
            full
        );
    }

    #[test]
    fn update_swaps_content_atomically() {
        let mut fx = fixture();
        login_and_list(&mut fx);
        let (sign_v1, _) = sign_for(b"v1", "a.txt");
        let q = fx
            .handler
            .handle_request(&single_chunk(MsgType::Create, &sign_v1, b"v1"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);

        let (sign_v2, digest_v2) = sign_for(b"v2-longer", "a.txt");
        let q = fx
            .handler
            .handle_request(&single_chunk(MsgType::Update, &sign_v2, b"v2-longer"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);

        let user_root = fx.user.dir().unwrap().path().to_path_buf();
        assert_eq!(fs::read(user_root.join("a.txt")).unwrap(), b"v2-longer");
        assert!(!user_root.join("a.txt.temp").exists());
        let rsrc = fx.user.dir().unwrap().rsrc(Path::new("a.txt")).unwrap();
        assert_eq!(rsrc.digest, digest_v2);
    }

    #[test]
    fn update_unknown_path_reports_not_exist() {
        let mut fx = fixture();
        login_and_list(&mut fx);
        let (sign, _) = sign_for(b"bytes", "ghost.txt");
        let q = fx
            .handler
            .handle_request(&single_chunk(MsgType::Update, &sign, b"bytes"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::UpdateNotExist);
    }

    #[test]
    fn update_same_digest_reports_already_updated() {
        let mut fx = fixture();
        login_and_list(&mut fx);
        let (sign, _) = sign_for(b"v1", "a.txt");
        let q = fx
            .handler
            .handle_request(&single_chunk(MsgType::Create, &sign, b"v1"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);
        let q = fx
            .handler
            .handle_request(&single_chunk(MsgType::Update, &sign, b"v1"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::UpdateAlreadyUpdated);
    }

    #[test]
    fn erase_removes_file_and_empty_ancestors() {
        let mut fx = fixture();
        login_and_list(&mut fx);
        let (sign, _) = sign_for(b"deep", "d/e/f.bin");
        let q = fx
            .handler
            .handle_request(&single_chunk(MsgType::Create, &sign, b"deep"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);

        let mut erase = Message::new(MsgType::Erase);
        erase.add_tlv(TlvType::Item, sign.as_bytes());
        erase.add_tlv(TlvType::End, &[]);
        let q = fx.handler.handle_request(&erase, &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);

        let user_root = fx.user.dir().unwrap().path().to_path_buf();
        assert!(!user_root.join("d/e/f.bin").exists());
        assert!(!user_root.join("d/e").exists());
        assert!(!user_root.join("d").exists());
        assert!(user_root.exists());
        assert!(!fx.user.dir().unwrap().contains(Path::new("d/e/f.bin")));
    }

    #[test]
    fn erase_digest_mismatch_is_rejected() {
        let mut fx = fixture();
        login_and_list(&mut fx);
        let (sign, _) = sign_for(b"keep me", "a.txt");
        let q = fx
            .handler
            .handle_request(&single_chunk(MsgType::Create, &sign, b"keep me"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);

        let stale = make_sign(Path::new("a.txt"), "ffffffffffffffffffffffffffffffff");
        let mut erase = Message::new(MsgType::Erase);
        erase.add_tlv(TlvType::Item, stale.as_bytes());
        erase.add_tlv(TlvType::End, &[]);
        let q = fx.handler.handle_request(&erase, &mut fx.user);
        assert_eq!(q.err_type(), ErrType::EraseNoMatch);
        assert!(fx.user.dir().unwrap().path().join("a.txt").exists());
    }

    #[test]
    fn retrieve_streams_file_in_chunks() {
        let mut fx = fixture();
        login_and_list(&mut fx);
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let user_root = fx.user.dir().unwrap().path().to_path_buf();
        fs::write(user_root.join("blob.bin"), &payload).unwrap();
        let file_digest = file_digest(&user_root.join("blob.bin"), Path::new("blob.bin")).unwrap();
        // register the resource the way a fresh LIST would
        fx.user
            .dir()
            .unwrap()
            .insert_or_assign(Path::new("blob.bin"), ServerResource::new(true, file_digest.clone()));

        let sign = make_sign(Path::new("blob.bin"), &file_digest);
        let mut request = Message::new(MsgType::Retrieve);
        request.add_tlv(TlvType::Item, sign.as_bytes());
        request.add_tlv(TlvType::End, &[]);
        let mut q = fx.handler.handle_request(&request, &mut fx.user);
        assert_eq!(q.msg_type(), MsgType::Retrieve);
        assert!(q.frame_count() > 2);

        let mut collected = Vec::new();
        let mut ended = false;
        while let Some(frame) = q.pop_front() {
            assert!(frame.len() <= SERVER_CHUNK_SIZE);
            for tlv in frame.view() {
                match tlv.tlv_type {
                    TlvType::Item => assert_eq!(tlv.value, sign.as_bytes()),
                    TlvType::Content => collected.extend_from_slice(tlv.value),
                    TlvType::End => ended = true,
                    other => panic!("unexpected record {:?}", other),
                }
            }
        }
        assert!(ended);
        assert_eq!(collected, payload);
    }

    #[test]
    fn retrieve_without_item_record_fails() {
        let mut fx = fixture();
        login_and_list(&mut fx);
        let mut request = Message::new(MsgType::Retrieve);
        request.add_tlv(TlvType::Content, b"bogus");
        request.add_tlv(TlvType::End, &[]);
        let q = fx.handler.handle_request(&request, &mut fx.user);
        assert_eq!(q.err_type(), ErrType::RetrieveFailed);
    }

    #[test]
    fn retrieve_missing_file_fails_cleanly() {
        let mut fx = fixture();
        login_and_list(&mut fx);
        let sign = make_sign(Path::new("ghost.bin"), "0123456789abcdef0123456789abcdef");
        let mut request = Message::new(MsgType::Retrieve);
        request.add_tlv(TlvType::Item, sign.as_bytes());
        request.add_tlv(TlvType::End, &[]);
        let q = fx.handler.handle_request(&request, &mut fx.user);
        assert_eq!(q.err_type(), ErrType::RetrieveFailed);
    }

    #[test]
    fn keep_alive_is_gated_behind_listing() {
        let mut fx = fixture();
        let q = fx.handler.handle_request(&auth_msg("alice", "wonderland"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);
        let mut msg = Message::new(MsgType::KeepAlive);
        msg.add_tlv(TlvType::End, &[]);
        let q = fx.handler.handle_request(&msg, &mut fx.user);
        assert_eq!(q.err_type(), ErrType::MsgTypeRejected);
    }

    #[test]
    fn large_listing_spans_multiple_frames() {
        let mut fx = fixture();
        let user_root = fx.backup_root.join(string_digest("alice"));
        let nested = user_root.join("some/quite/deeply/nested/directory/path");
        fs::create_dir_all(&nested).unwrap();
        for i in 0..120 {
            fs::write(nested.join(format!("file-with-a-long-name-{:04}.data", i)), b"x").unwrap();
        }

        let q = fx.handler.handle_request(&auth_msg("alice", "wonderland"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);
        let mut q = fx.handler.handle_request(&list_msg(), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);
        assert!(q.frame_count() > 1);
        let records = reply_records(&mut q);
        let items = records.iter().filter(|(t, _)| *t == TlvType::Item).count();
        assert_eq!(items, 120);
        assert_eq!(records.last().unwrap().0, TlvType::End);
    }

    #[test]
    fn empty_file_create_round_trips() {
        let mut fx = fixture();
        login_and_list(&mut fx);
        let (sign, digest) = sign_for(b"", "empty.txt");
        let q = fx
            .handler
            .handle_request(&single_chunk(MsgType::Create, &sign, b""), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);
        let on_disk = fx.user.dir().unwrap().path().join("empty.txt");
        assert_eq!(fs::read(&on_disk).unwrap(), b"");
        assert_eq!(fx.user.dir().unwrap().rsrc(Path::new("empty.txt")).unwrap().digest, digest);
    }

    #[test]
    fn keep_alive_replies_ok() {
        let mut fx = fixture();
        login_and_list(&mut fx);
        let mut msg = Message::new(MsgType::KeepAlive);
        msg.add_tlv(TlvType::End, &[]);
        let mut q = fx.handler.handle_request(&msg, &mut fx.user);
        assert_eq!(q.err_type(), ErrType::None);
        let records = reply_records(&mut q);
        assert_eq!(records[0].0, TlvType::Ok);
        assert_eq!(records[1].0, TlvType::End);
    }

    #[test]
    fn traversal_paths_are_rejected() {
        let mut fx = fixture();
        login_and_list(&mut fx);
        let sign = make_sign(Path::new("../escape.txt"), "0123456789abcdef0123456789abcdef");
        let q = fx
            .handler
            .handle_request(&single_chunk(MsgType::Create, &sign, b"gotcha"), &mut fx.user);
        assert_eq!(q.err_type(), ErrType::CreateFailed);
        assert!(!fx.backup_root.join("escape.txt").exists());
    }
}
