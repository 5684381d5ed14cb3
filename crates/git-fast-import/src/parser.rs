//! Parser for the fast-import command language (§6): turns a byte stream
//! into a sequence of [`Command`]s. Knows nothing about packs, marks, or
//! branches — that's [`crate::engine::FastImportEngine`]'s job.

use std::io::BufRead;

use bstr::{BStr, BString, ByteSlice};
use git_hash::ObjectId;
use git_object::FileMode;
use git_utils::date::{GitDate, Signature};

use crate::{FastImportError, Result};

/// Parse an ident line (`Name <email> <when>`), special-casing the `now`
/// date keyword used under `--date-format=now`, which `Signature::parse`
/// has no notion of.
fn parse_ident(raw: &[u8]) -> Result<Signature> {
    if let Some(rest) = raw.strip_suffix(b" now") {
        let gt = rest
            .iter()
            .rposition(|&b| b == b'>')
            .ok_or_else(|| FastImportError::Format("bad ident: missing '>'".into()))?;
        let lt = rest[..gt]
            .iter()
            .rposition(|&b| b == b'<')
            .ok_or_else(|| FastImportError::Format("bad ident: missing '<'".into()))?;
        return Ok(Signature {
            name: BString::from(rest[..lt].trim()),
            email: BString::from(&rest[lt + 1..gt]),
            date: GitDate::now(),
        });
    }
    Signature::parse(BStr::new(raw)).map_err(|e| FastImportError::Format(format!("bad ident: {e}")))
}

/// Something that identifies an existing or pending object: a mark, a raw
/// hex id, or (for file changes) literal data to be stored inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataRef {
    Mark(u64),
    Sha1(ObjectId),
    Inline(Vec<u8>),
}

/// A reference to a commit that may not exist yet: by mark, by hex id, or
/// by ref/branch name (optionally with a `~n`/`^` suffix, kept verbatim).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitIsh {
    Mark(u64),
    Sha1(ObjectId),
    Ref(BString),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Modify { path: BString, mode: FileMode, data: DataRef },
    Delete { path: BString },
    Copy { src: BString, dst: BString },
    Rename { src: BString, dst: BString },
    Note { commit_ish: CommitIsh, data: DataRef },
    DeleteAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitCommand {
    pub ref_name: BString,
    pub mark: Option<u64>,
    pub original_oid: Option<BString>,
    pub author: Option<Signature>,
    pub committer: Signature,
    pub message: Vec<u8>,
    pub from: Option<CommitIsh>,
    pub merges: Vec<CommitIsh>,
    pub file_changes: Vec<FileChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCommand {
    pub name: BString,
    pub mark: Option<u64>,
    pub from: CommitIsh,
    pub original_oid: Option<BString>,
    pub tagger: Option<Signature>,
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Blob { mark: Option<u64>, original_oid: Option<BString>, data: Vec<u8> },
    Commit(CommitCommand),
    Tag(TagCommand),
    Reset { ref_name: BString, from: Option<CommitIsh> },
    Checkpoint,
    Progress(BString),
    Ls { root: Option<CommitIsh>, path: BString },
    CatBlob(CommitIsh),
    GetMark(u64),
    Alias { mark: u64, to: CommitIsh },
    Feature { name: BString, value: Option<BString> },
    Option(BString),
    Done,
}

/// Streaming parser over a fast-import command stream.
pub struct Parser<R> {
    reader: R,
    /// A line read ahead while deciding what command it belongs to, put
    /// back for the next call to `next_command`.
    pending_line: Option<Vec<u8>>,
    line_no: u64,
}

impl<R: BufRead> Parser<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, pending_line: None, line_no: 0 }
    }

    fn read_raw_line(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(line) = self.pending_line.take() {
            return Ok(Some(line));
        }
        let mut buf = Vec::new();
        let n = self.reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        Ok(Some(buf))
    }

    fn putback(&mut self, line: Vec<u8>) {
        self.pending_line = Some(line);
    }

    /// Skip blank lines and `#`-comment lines, returning the next
    /// significant line, or `None` at end of stream.
    fn next_significant_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.read_raw_line()? {
                None => return Ok(None),
                Some(line) if line.is_empty() || line.starts_with(b"#") => continue,
                Some(line) => return Ok(Some(line)),
            }
        }
    }

    /// Parse the next top-level command, or `None` at end of stream.
    pub fn next_command(&mut self) -> Result<Option<Command>> {
        let Some(line) = self.next_significant_line()? else {
            return Ok(None);
        };
        let command = self.dispatch(&line)?;
        Ok(Some(command))
    }

    fn dispatch(&mut self, line: &[u8]) -> Result<Command> {
        if let Some(rest) = strip_prefix(line, b"blob") {
            let _ = rest;
            return self.parse_blob();
        }
        if let Some(rest) = strip_prefix(line, b"commit ") {
            return self.parse_commit(rest);
        }
        if let Some(rest) = strip_prefix(line, b"tag ") {
            return self.parse_tag(rest);
        }
        if let Some(rest) = strip_prefix(line, b"reset ") {
            return self.parse_reset(rest);
        }
        if line == b"checkpoint" {
            return Ok(Command::Checkpoint);
        }
        if let Some(rest) = strip_prefix(line, b"progress ") {
            return Ok(Command::Progress(BString::from(rest)));
        }
        if let Some(rest) = strip_prefix(line, b"ls ") {
            return self.parse_ls(rest);
        }
        if let Some(rest) = strip_prefix(line, b"cat-blob ") {
            return Ok(Command::CatBlob(parse_commit_ish(rest)?));
        }
        if let Some(rest) = strip_prefix(line, b"get-mark ") {
            return Ok(Command::GetMark(parse_mark_ref(rest)?));
        }
        if line == b"alias" {
            return self.parse_alias();
        }
        if let Some(rest) = strip_prefix(line, b"feature ") {
            return Ok(parse_feature(rest));
        }
        if let Some(rest) = strip_prefix(line, b"option ") {
            return Ok(Command::Option(BString::from(rest)));
        }
        if line == b"done" {
            return Ok(Command::Done);
        }
        Err(FastImportError::unknown_command(String::from_utf8_lossy(line)))
    }

    fn parse_blob(&mut self) -> Result<Command> {
        let mut mark = None;
        let mut original_oid = None;
        loop {
            let Some(line) = self.next_significant_line()? else {
                return Err(FastImportError::Format("blob: unexpected end of stream".into()));
            };
            if let Some(rest) = strip_prefix(&line, b"mark :") {
                mark = Some(parse_u64(rest)?);
            } else if let Some(rest) = strip_prefix(&line, b"original-oid ") {
                original_oid = Some(BString::from(rest));
            } else if let Some(rest) = strip_prefix(&line, b"data") {
                let data = self.read_data(rest)?;
                return Ok(Command::Blob { mark, original_oid, data });
            } else {
                return Err(FastImportError::Format(format!(
                    "blob: unexpected line '{}'",
                    BStr::new(&line)
                )));
            }
        }
    }

    fn parse_commit(&mut self, ref_name: &[u8]) -> Result<Command> {
        let ref_name = BString::from(ref_name);
        let mut mark = None;
        let mut original_oid = None;
        let mut author = None;
        let mut committer = None;
        let mut from = None;
        let mut merges = Vec::new();
        let mut message = Vec::new();
        let mut file_changes = Vec::new();

        loop {
            let Some(line) = self.next_significant_line()? else {
                break;
            };
            if let Some(rest) = strip_prefix(&line, b"mark :") {
                mark = Some(parse_u64(rest)?);
            } else if let Some(rest) = strip_prefix(&line, b"original-oid ") {
                original_oid = Some(BString::from(rest));
            } else if let Some(rest) = strip_prefix(&line, b"author ") {
                author = Some(parse_ident(rest)?);
            } else if let Some(rest) = strip_prefix(&line, b"committer ") {
                committer = Some(parse_ident(rest)?);
            } else if let Some(rest) = strip_prefix(&line, b"data") {
                message = self.read_data(rest)?;
            } else if let Some(rest) = strip_prefix(&line, b"from ") {
                from = Some(parse_commit_ish(rest)?);
            } else if let Some(rest) = strip_prefix(&line, b"merge ") {
                merges.push(parse_commit_ish(rest)?);
            } else if committer.is_none() {
                return Err(FastImportError::Format(
                    "commit: missing required 'committer' line".into(),
                ));
            } else if let Some(change) = self.try_parse_file_change(&line)? {
                file_changes.push(change);
            } else {
                self.putback(line);
                break;
            }
        }

        let committer = committer
            .ok_or_else(|| FastImportError::Format("commit: missing 'committer' line".into()))?;

        Ok(Command::Commit(CommitCommand {
            ref_name,
            mark,
            original_oid,
            author,
            committer,
            message,
            from,
            merges,
            file_changes,
        }))
    }

    fn try_parse_file_change(&mut self, line: &[u8]) -> Result<Option<FileChange>> {
        if let Some(rest) = strip_prefix(line, b"M ") {
            let mut parts = rest.splitn(3, |&b| b == b' ');
            let mode_bytes = parts.next().ok_or_else(|| bad_filechange("M"))?;
            let dataref_token = parts.next().ok_or_else(|| bad_filechange("M"))?;
            let path_bytes = parts.next().ok_or_else(|| bad_filechange("M"))?;
            let mode = parse_mode(mode_bytes)?;
            let path = unquote_path(path_bytes);
            let data = if dataref_token == b"inline" {
                let Some(data_line) = self.next_significant_line()? else {
                    return Err(FastImportError::Format("M inline: missing data command".into()));
                };
                let rest = strip_prefix(&data_line, b"data")
                    .ok_or_else(|| FastImportError::Format("M inline: expected 'data'".into()))?;
                DataRef::Inline(self.read_data(rest)?)
            } else {
                parse_dataref(dataref_token)?
            };
            return Ok(Some(FileChange::Modify { path, mode, data }));
        }
        if let Some(rest) = strip_prefix(line, b"D ") {
            return Ok(Some(FileChange::Delete { path: unquote_path(rest) }));
        }
        if let Some(rest) = strip_prefix(line, b"R ") {
            let (src, dst) = split_two_paths(rest, "R")?;
            return Ok(Some(FileChange::Rename { src, dst }));
        }
        if let Some(rest) = strip_prefix(line, b"C ") {
            let (src, dst) = split_two_paths(rest, "C")?;
            return Ok(Some(FileChange::Copy { src, dst }));
        }
        if let Some(rest) = strip_prefix(line, b"N ") {
            let mut parts = rest.splitn(2, |&b| b == b' ');
            let commit_ish_token = parts.next().ok_or_else(|| bad_filechange("N"))?;
            let dataref_token = parts.next().ok_or_else(|| bad_filechange("N"))?;
            let commit_ish = parse_commit_ish(commit_ish_token)?;
            let data = if dataref_token == b"inline" {
                let Some(data_line) = self.next_significant_line()? else {
                    return Err(FastImportError::Format("N inline: missing data command".into()));
                };
                let rest = strip_prefix(&data_line, b"data")
                    .ok_or_else(|| FastImportError::Format("N inline: expected 'data'".into()))?;
                DataRef::Inline(self.read_data(rest)?)
            } else {
                parse_dataref(dataref_token)?
            };
            return Ok(Some(FileChange::Note { commit_ish, data }));
        }
        if line == b"deleteall" {
            return Ok(Some(FileChange::DeleteAll));
        }
        Ok(None)
    }

    fn parse_tag(&mut self, name: &[u8]) -> Result<Command> {
        let name = BString::from(name);
        let mut mark = None;
        let mut original_oid = None;
        let mut tagger = None;
        let mut from = None;
        let mut message = Vec::new();

        loop {
            let Some(line) = self.next_significant_line()? else {
                break;
            };
            if let Some(rest) = strip_prefix(&line, b"mark :") {
                mark = Some(parse_u64(rest)?);
            } else if let Some(rest) = strip_prefix(&line, b"original-oid ") {
                original_oid = Some(BString::from(rest));
            } else if let Some(rest) = strip_prefix(&line, b"from ") {
                from = Some(parse_commit_ish(rest)?);
            } else if let Some(rest) = strip_prefix(&line, b"tagger ") {
                tagger = Some(parse_ident(rest)?);
            } else if let Some(rest) = strip_prefix(&line, b"data") {
                message = self.read_data(rest)?;
                break;
            } else {
                self.putback(line);
                break;
            }
        }

        let from = from.ok_or_else(|| FastImportError::Format("tag: missing 'from' line".into()))?;

        Ok(Command::Tag(TagCommand { name, mark, from, original_oid, tagger, message }))
    }

    fn parse_reset(&mut self, rest: &[u8]) -> Result<Command> {
        let (ref_bytes, from_bytes) = match rest.find(b" from ") {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 6..])),
            None => (rest, None),
        };
        let from = from_bytes.map(parse_commit_ish).transpose()?;
        Ok(Command::Reset { ref_name: BString::from(ref_bytes), from })
    }

    fn parse_ls(&mut self, rest: &[u8]) -> Result<Command> {
        // `ls [<tree-ish>] <path>`: if there's a space, the first token is
        // a tree-ish and the remainder is the path; a bare path has none.
        match rest.find_byte(b' ') {
            Some(idx) => {
                let root = parse_commit_ish(&rest[..idx])?;
                Ok(Command::Ls { root: Some(root), path: unquote_path(&rest[idx + 1..]) })
            }
            None => Ok(Command::Ls { root: None, path: unquote_path(rest) }),
        }
    }

    fn parse_alias(&mut self) -> Result<Command> {
        let Some(mark_line) = self.next_significant_line()? else {
            return Err(FastImportError::Format("alias: missing 'mark' line".into()));
        };
        let mark_bytes = strip_prefix(&mark_line, b"mark :")
            .ok_or_else(|| FastImportError::Format("alias: expected 'mark' line".into()))?;
        let mark = parse_u64(mark_bytes)?;

        let Some(to_line) = self.next_significant_line()? else {
            return Err(FastImportError::Format("alias: missing 'to' line".into()));
        };
        let to_bytes = strip_prefix(&to_line, b"to ")
            .ok_or_else(|| FastImportError::Format("alias: expected 'to' line".into()))?;
        let to = parse_commit_ish(to_bytes)?;

        Ok(Command::Alias { mark, to })
    }

    /// Read a `data` block's payload, given what followed the `data` token
    /// on its line (either ` <len>` or ` <<<delim>` / ` <<'<delim>'`).
    fn read_data(&mut self, rest: &[u8]) -> Result<Vec<u8>> {
        let rest = rest.strip_prefix(b" ").unwrap_or(rest);
        if let Some(delim) = rest.strip_prefix(b"<<") {
            let delim = unquote_delim(delim);
            let mut out = Vec::new();
            loop {
                let Some(line) = self.read_raw_line()? else {
                    return Err(FastImportError::Format(
                        "data: stream ended before delimiter".into(),
                    ));
                };
                if line == delim.as_slice() {
                    break;
                }
                out.extend_from_slice(&line);
                out.push(b'\n');
            }
            Ok(out)
        } else {
            let len: usize = std::str::from_utf8(rest)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| FastImportError::Format(format!("data: bad length '{}'", BStr::new(rest))))?;
            let mut buf = vec![0u8; len];
            use std::io::Read;
            self.reader.read_exact(&mut buf)?;
            // Consume the trailing LF that follows the exact-length block.
            let mut lf = [0u8; 1];
            if self.reader.read(&mut lf)? == 1 && lf[0] != b'\n' {
                return Err(FastImportError::Format("data: missing trailing newline".into()));
            }
            Ok(buf)
        }
    }
}

fn bad_filechange(cmd: &str) -> FastImportError {
    FastImportError::Format(format!("{cmd}: malformed file-change line"))
}

fn split_two_paths(rest: &[u8], cmd: &str) -> Result<(BString, BString)> {
    // Paths may be quoted, so split on the first unquoted space.
    let split = if rest.first() == Some(&b'"') {
        find_quoted_split(rest).ok_or_else(|| bad_filechange(cmd))?
    } else {
        rest.find_byte(b' ').ok_or_else(|| bad_filechange(cmd))?
    };
    Ok((unquote_path(&rest[..split]), unquote_path(&rest[split + 1..])))
}

fn find_quoted_split(rest: &[u8]) -> Option<usize> {
    let mut i = 1;
    let mut escaped = false;
    while i < rest.len() {
        match rest[i] {
            b'\\' if !escaped => escaped = true,
            b'"' if !escaped => return Some(i + 1),
            _ => escaped = false,
        }
        i += 1;
    }
    None
}

fn unquote_path(raw: &[u8]) -> BString {
    if raw.len() >= 2 && raw[0] == b'"' && raw[raw.len() - 1] == b'"' {
        let inner = &raw[1..raw.len() - 1];
        let mut out = Vec::with_capacity(inner.len());
        let mut chars = inner.iter().copied();
        while let Some(b) = chars.next() {
            if b == b'\\' {
                match chars.next() {
                    Some(b'n') => out.push(b'\n'),
                    Some(b't') => out.push(b'\t'),
                    Some(b'"') => out.push(b'"'),
                    Some(b'\\') => out.push(b'\\'),
                    Some(other) => out.push(other),
                    None => out.push(b'\\'),
                }
            } else {
                out.push(b);
            }
        }
        BString::from(out)
    } else {
        BString::from(raw)
    }
}

fn unquote_delim(raw: &[u8]) -> Vec<u8> {
    if raw.len() >= 2 && (raw[0] == b'\'' || raw[0] == b'"') && raw[raw.len() - 1] == raw[0] {
        raw[1..raw.len() - 1].to_vec()
    } else {
        raw.to_vec()
    }
}

fn parse_mode(raw: &[u8]) -> Result<FileMode> {
    let normalized: &[u8] = match raw {
        b"644" => b"100644",
        b"755" => b"100755",
        b"40000" => b"040000",
        other => other,
    };
    FileMode::from_bytes(normalized)
        .map_err(|e| FastImportError::Format(format!("bad mode '{}': {e}", BStr::new(raw))))
}

fn parse_dataref(token: &[u8]) -> Result<DataRef> {
    if let Some(rest) = token.strip_prefix(b":") {
        Ok(DataRef::Mark(parse_u64(rest)?))
    } else {
        let hex = std::str::from_utf8(token)
            .map_err(|_| FastImportError::Format("dataref: invalid utf-8".into()))?;
        Ok(DataRef::Sha1(ObjectId::from_hex(hex).map_err(|e| {
            FastImportError::Format(format!("dataref: bad hex id: {e}"))
        })?))
    }
}

fn parse_commit_ish(token: &[u8]) -> Result<CommitIsh> {
    if let Some(rest) = token.strip_prefix(b":") {
        return Ok(CommitIsh::Mark(parse_u64(rest)?));
    }
    if let Ok(hex) = std::str::from_utf8(token) {
        if token.len() >= 40 && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            if let Ok(id) = ObjectId::from_hex(hex) {
                return Ok(CommitIsh::Sha1(id));
            }
        }
    }
    Ok(CommitIsh::Ref(BString::from(token)))
}

fn parse_mark_ref(token: &[u8]) -> Result<u64> {
    let rest = token
        .strip_prefix(b":")
        .ok_or_else(|| FastImportError::Format("expected mark reference ':<id>'".into()))?;
    parse_u64(rest)
}

fn parse_u64(raw: &[u8]) -> Result<u64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| FastImportError::Format(format!("expected integer, got '{}'", BStr::new(raw))))
}

fn parse_feature(rest: &[u8]) -> Command {
    match rest.find_byte(b'=') {
        Some(idx) => Command::Feature {
            name: BString::from(&rest[..idx]),
            value: Some(BString::from(&rest[idx + 1..])),
        },
        None => Command::Feature { name: BString::from(rest), value: None },
    }
}

fn strip_prefix<'a>(line: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    line.strip_prefix(prefix)
}
