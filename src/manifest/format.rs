//! Textual manifest format.
//!
//! ```text
//! MANIFEST\t3
//! version:\t20
//! previous:\t10
//! component:\teditors
//! filecount:\t2
//! contentsize:\t4096
//! includes:\tos-core
//!
//! F.....\t<hash>\t20\t100644\t0\t0\t0\t4096\t/usr/bin/vi
//! .d....\t<hash>\t20\t0\t0\t0\t0\t0\t/usr/bin/ex
//! action:\tupdate-helper
//! ```
//!
//! Flags are six positions: type (`F` `D` `L` `M` `.`), deletion (`d` `g`
//! `.`), then `C` config, `s` state, `b` boot, `r` rename. Formats before 3
//! carry four flag positions (a single modifier slot) and no stat columns.
//! Changing field order, flag encoding or hash length is a breaking change.

use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, IoContext, Result};
use crate::file::{File, FileKind, Modifiers, Stat};
use crate::hash::ContentHash;
use crate::manifest::Manifest;
use crate::state::fopen_exclusive;

/// Format written by this server.
pub const FORMAT_CURRENT: u32 = 3;

/// First format whose entries carry stat columns and six flag positions.
pub const FORMAT_STAT: u32 = 3;

const MAGIC: &str = "MANIFEST";
const ACTION_PREFIX: &str = "action:\t";

/// Path of `Manifest.<module>` for `version` under the output directory.
pub fn manifest_path(output_dir: &Path, version: u32, module: &str) -> PathBuf {
    output_dir
        .join(version.to_string())
        .join(format!("Manifest.{module}"))
}

/// Flag string for `file` in the given format.
pub fn file_type_to_string(file: &File, format: u32) -> Result<String> {
    let (type_char, status_char) = match file.kind {
        FileKind::Regular => ('F', '.'),
        FileKind::Directory => ('D', '.'),
        FileKind::Symlink => ('L', '.'),
        FileKind::Manifest => ('M', '.'),
        FileKind::Deleted => ('.', 'd'),
        FileKind::Ghosted => ('.', 'g'),
    };
    let m = file.modifiers;
    let rename = if m.rename { 'r' } else { '.' };
    let mut flags = String::with_capacity(6);
    flags.push(type_char);
    flags.push(status_char);

    if format >= FORMAT_STAT {
        flags.push(if m.config { 'C' } else { '.' });
        flags.push(if m.state { 's' } else { '.' });
        flags.push(if m.boot { 'b' } else { '.' });
    } else {
        let set: Vec<char> = [(m.config, 'C'), (m.state, 's'), (m.boot, 'b')]
            .into_iter()
            .filter_map(|(on, c)| on.then_some(c))
            .collect();
        match set.as_slice() {
            [] => flags.push('.'),
            [c] => flags.push(*c),
            _ => {
                return Err(Error::Invariant(format!(
                    "{}: format {format} cannot encode more than one modifier",
                    file.filename
                )))
            }
        }
    }
    flags.push(rename);
    Ok(flags)
}

fn parse_flags(flags: &str, format: u32) -> Result<(FileKind, Modifiers)> {
    let chars: Vec<char> = flags.chars().collect();
    let expected = if format >= FORMAT_STAT { 6 } else { 4 };
    if chars.len() != expected {
        return Err(Error::format(format!(
            "flags {flags:?}: expected {expected} positions for format {format}"
        )));
    }

    let t = chars[0];
    let s = chars[1];
    if !"FDLM.".contains(t) || !"dg.".contains(s) {
        return Err(Error::format(format!("flags {flags:?}: unknown type")));
    }
    let kind = FileKind::from_flags(t == 'D', t == 'F', t == 'L', s == 'd', s == 'g', t == 'M')?;

    let mut modifiers = Modifiers::default();
    let rename_char = if format >= FORMAT_STAT {
        modifiers.config = flag_at(&chars, 2, 'C', flags)?;
        modifiers.state = flag_at(&chars, 3, 's', flags)?;
        modifiers.boot = flag_at(&chars, 4, 'b', flags)?;
        chars[5]
    } else {
        match chars[2] {
            'C' => modifiers.config = true,
            's' => modifiers.state = true,
            'b' => modifiers.boot = true,
            '.' => {}
            other => {
                return Err(Error::format(format!(
                    "flags {flags:?}: unknown modifier {other:?}"
                )))
            }
        }
        chars[3]
    };
    modifiers.rename = match rename_char {
        'r' => true,
        '.' => false,
        other => {
            return Err(Error::format(format!(
                "flags {flags:?}: unknown rename marker {other:?}"
            )))
        }
    };

    Ok((kind, modifiers))
}

fn flag_at(chars: &[char], idx: usize, on: char, flags: &str) -> Result<bool> {
    match chars[idx] {
        c if c == on => Ok(true),
        '.' => Ok(false),
        other => Err(Error::format(format!(
            "flags {flags:?}: unexpected {other:?} at position {idx}"
        ))),
    }
}

/// Reject a filename that an entry line cannot carry intact.
///
/// Lines end at `\n` (and a trailing `\r` is dropped on read); fields are
/// split on `\t`.
pub fn check_filename(filename: &str) -> Result<()> {
    if filename.is_empty() || filename.contains(['\n', '\r', '\t']) {
        return Err(Error::format(format!(
            "filename {filename:?} cannot be recorded in a manifest"
        )));
    }
    Ok(())
}

fn write_entry(out: &mut String, file: &File, format: u32) -> Result<()> {
    check_filename(&file.filename)?;
    let flags = file_type_to_string(file, format)?;
    // Writing into a String cannot fail.
    let _ = if format >= FORMAT_STAT {
        writeln!(
            out,
            "{flags}\t{}\t{}\t{:o}\t{}\t{}\t{}\t{}\t{}",
            file.hash,
            file.last_change,
            file.stat.mode,
            file.stat.uid,
            file.stat.gid,
            file.stat.rdev,
            file.stat.size,
            file.filename
        )
    } else {
        writeln!(
            out,
            "{flags}\t{}\t{}\t{}",
            file.hash, file.last_change, file.filename
        )
    };
    Ok(())
}

/// Serialize a manifest to its textual form.
pub fn manifest_to_string(manifest: &Manifest) -> Result<String> {
    manifest.validate()?;

    let mut out = String::new();
    let _ = writeln!(out, "{MAGIC}\t{}", manifest.format);
    let _ = writeln!(out, "version:\t{}", manifest.version);
    let _ = writeln!(out, "previous:\t{}", manifest.prevversion);
    let _ = writeln!(out, "component:\t{}", manifest.component);
    let _ = writeln!(out, "filecount:\t{}", manifest.count());
    let _ = writeln!(out, "contentsize:\t{}", manifest.contentsize);
    for include in &manifest.includes {
        let _ = writeln!(out, "includes:\t{include}");
    }
    out.push('\n');

    for file in manifest.files.iter().chain(manifest.manifests.iter()) {
        write_entry(&mut out, file, manifest.format)?;
    }
    for action in &manifest.actions {
        let _ = writeln!(out, "{ACTION_PREFIX}{action}");
    }
    Ok(out)
}

/// Parse the textual form. Ephemeral fields are empty in the result.
pub fn parse_manifest(text: &str) -> Result<Manifest> {
    let mut lines = text.lines();

    let first = lines
        .next()
        .ok_or_else(|| Error::format("empty manifest"))?;
    let format = first
        .strip_prefix(MAGIC)
        .and_then(|rest| rest.strip_prefix('\t'))
        .and_then(|v| v.trim().parse::<u32>().ok())
        .ok_or_else(|| Error::format(format!("bad manifest magic line {first:?}")))?;

    let mut manifest = Manifest::new(0, "", format);
    let mut version = None;
    let mut filecount = None;

    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once(":\t") else {
            return Err(Error::format(format!("bad header line {line:?}")));
        };
        match key {
            "version" => version = Some(parse_num::<u32>(value, line)?),
            "previous" => manifest.prevversion = parse_num(value, line)?,
            "component" => manifest.component = value.to_string(),
            "filecount" => filecount = Some(parse_num::<usize>(value, line)?),
            "contentsize" => manifest.contentsize = parse_num(value, line)?,
            "includes" => manifest.includes.push(value.to_string()),
            // Fields from other format revisions are tolerated.
            _ => {}
        }
    }
    manifest.version = version.ok_or_else(|| Error::format("manifest has no version"))?;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some(action) = line.strip_prefix(ACTION_PREFIX) {
            manifest.actions.push(action.to_string());
            continue;
        }
        let file = parse_entry(line, format)?;
        if file.kind == FileKind::Manifest {
            manifest.manifests.push(file);
        } else {
            manifest.files.push(file);
        }
    }

    if let Some(count) = filecount {
        if count != manifest.count() {
            return Err(Error::format(format!(
                "manifest {} declares {count} entries but has {}",
                manifest.component,
                manifest.count()
            )));
        }
    }
    manifest.validate()?;
    Ok(manifest)
}

fn parse_entry(line: &str, format: u32) -> Result<File> {
    let columns = if format >= FORMAT_STAT { 9 } else { 4 };
    let fields: Vec<&str> = line.splitn(columns, '\t').collect();
    if fields.len() != columns {
        return Err(Error::format(format!("bad entry line {line:?}")));
    }

    let (kind, modifiers) = parse_flags(fields[0], format)?;
    let hash: ContentHash = fields[1].parse()?;
    let last_change = parse_num(fields[2], line)?;

    let (stat, filename) = if format >= FORMAT_STAT {
        let mode = u64::from_str_radix(fields[3], 8)
            .map_err(|_| Error::format(format!("bad mode in {line:?}")))?;
        let stat = Stat {
            mode,
            uid: parse_num(fields[4], line)?,
            gid: parse_num(fields[5], line)?,
            rdev: parse_num(fields[6], line)?,
            size: parse_num(fields[7], line)?,
        };
        (stat, fields[8])
    } else {
        (Stat::default(), fields[3])
    };

    let mut file = File::new(filename, kind);
    file.hash = hash;
    file.modifiers = modifiers;
    file.stat = stat;
    file.last_change = last_change;
    Ok(file)
}

fn parse_num<T: std::str::FromStr>(value: &str, line: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::format(format!("bad number {value:?} in {line:?}")))
}

/// Write `Manifest.<component>` into `dir`, refusing to overwrite.
pub fn write_manifest(manifest: &Manifest, dir: &Path) -> Result<PathBuf> {
    let text = manifest_to_string(manifest)?;
    fs::create_dir_all(dir).at(dir)?;
    let path = dir.join(format!("Manifest.{}", manifest.component));

    let mut out = fopen_exclusive(&path)?;
    if let Err(e) = out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
        drop(out);
        let _ = fs::remove_file(&path);
        return Err(Error::io(&path, e));
    }

    tracing::debug!(
        component = %manifest.component,
        version = manifest.version,
        entries = manifest.count(),
        "wrote manifest"
    );
    Ok(path)
}

/// Load `Manifest.<module>` for `version` from the output directory.
pub fn manifest_from_file(output_dir: &Path, version: u32, module: &str) -> Result<Manifest> {
    let path = manifest_path(output_dir, version, module);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::format(format!(
                "manifest {module} for version {version} not found at {}",
                path.display()
            )))
        }
        Err(e) => return Err(Error::io(&path, e)),
    };

    let manifest = parse_manifest(&text)
        .map_err(|e| Error::format(format!("{}: {e}", path.display())))?;
    if manifest.version != version || manifest.component != module {
        return Err(Error::format(format!(
            "{} claims to be {} version {}",
            path.display(),
            manifest.component,
            manifest.version
        )));
    }
    Ok(manifest)
}
