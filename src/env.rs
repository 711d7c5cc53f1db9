//! The boot environment and the constants partition.
//!
//! Both are flat `name=value` string maps. The environment is what the update script reads and
//! writes; the constants hold per-device values (serial number, MAC, encryption key) that survive
//! firmware updates.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use crc::{Crc, CRC_32_ISO_HDLC};
use log::{debug, warn};

/// Ordered string variables, plus shell-local ones that are never persisted
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
    locals: BTreeMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.vars.insert(name.to_string(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.vars.remove(name)
    }

    /// Set a variable visible to the running script only.
    pub fn set_local(&mut self, name: &str, value: impl Into<String>) {
        self.locals.insert(name.to_string(), value.into());
    }

    pub fn get_local(&self, name: &str) -> Option<&str> {
        self.locals.get(name).map(String::as_str)
    }

    /// Look a name up the way the shell does: locals shadow the environment.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.get_local(name).or_else(|| self.get(name))
    }

    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn locals(&self) -> impl Iterator<Item = (&str, &str)> {
        self.locals.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parse `name=value` lines. Blank lines and lines starting with `#` are skipped.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut env = Self::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((name, value)) = line.split_once('=') else {
                anyhow::bail!("line {}: expected name=value", number + 1);
            };
            env.set(name, value);
        }
        Ok(env)
    }

    pub fn to_text(&self) -> String {
        self.vars
            .iter()
            .map(|(name, value)| format!("{name}={value}\n"))
            .collect()
    }

    /// Read the environment from `path`; a missing file is an empty environment.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).with_context(|| format!("parsing {}", path.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        fs::write(path, self.to_text()).with_context(|| format!("writing {}", path.display()))
    }
}

/// Size of the constants area, CRC included
pub const CONSTANTS_SIZE: usize = 0x4000;
const CRC_LEN: usize = 4;
const DATA_SIZE: usize = CONSTANTS_SIZE - CRC_LEN;

const CONST_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Constants that may be set once but never changed
const WRITE_ONCE: &[&str] = &["serial#", "mac"];

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum ConstError {
    #[error("illegal character '=' in variable name \"{0}\"")]
    IllegalName(String),

    #[error("Can't overwrite \"{0}\"")]
    ReadOnly(String),

    #[error("\"{0}\" not defined in Constants")]
    NotDefined(String),

    #[error("constants need {0} bytes, only {DATA_SIZE} fit")]
    TooLarge(usize),

    #[error("constants have no backing store")]
    NoStore,
}

/// The constants partition: a little-endian CRC32 over the data area, then `name=value`
/// records separated by NUL bytes and terminated by an empty record.
#[derive(Debug, Default, Clone)]
pub struct Constants {
    vars: BTreeMap<String, String>,
    valid: bool,
    path: Option<PathBuf>,
}

impl Constants {
    /// Decode a constants image. A bad CRC yields the (empty) defaults.
    pub fn import(image: &[u8]) -> Self {
        let mut constants = Self::default();

        if image.len() < CONSTANTS_SIZE {
            warn!("constants image is {} bytes, using default constants", image.len());
            return constants;
        }

        let (crc, data) = image[..CONSTANTS_SIZE].split_at(CRC_LEN);
        let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if CONST_CRC.checksum(data) != stored {
            warn!("bad CRC, using default constants");
            return constants;
        }

        for record in data.split(|&b| b == 0) {
            if record.is_empty() {
                break;
            }
            let record = String::from_utf8_lossy(record);
            match record.split_once('=') {
                Some((name, value)) => {
                    constants.vars.insert(name.to_string(), value.to_string());
                }
                None => debug!("skipping constants record without '=': {record:?}"),
            }
        }

        constants.valid = true;
        constants
    }

    /// Encode the constants into a full-size image with a fresh CRC.
    pub fn export(&self) -> Result<Vec<u8>, ConstError> {
        let mut data = Vec::with_capacity(CONSTANTS_SIZE);
        data.extend_from_slice(&[0; CRC_LEN]);
        for (name, value) in &self.vars {
            data.extend_from_slice(name.as_bytes());
            data.push(b'=');
            data.extend_from_slice(value.as_bytes());
            data.push(0);
        }

        // Room for the terminating empty record
        let needed = data.len() - CRC_LEN + 1;
        if needed > DATA_SIZE {
            return Err(ConstError::TooLarge(needed));
        }
        data.resize(CONSTANTS_SIZE, 0);

        let crc = CONST_CRC.checksum(&data[CRC_LEN..]);
        data[..CRC_LEN].copy_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Load the constants stored at `path`, remembering it for [`save`](Self::save) and
    /// [`reload`](Self::reload). A missing file gives the defaults.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut constants = Self::read(&path)?;
        constants.path = Some(path);
        Ok(constants)
    }

    fn read(path: &Path) -> anyhow::Result<Self> {
        match fs::read(path) {
            Ok(image) => Ok(Self::import(&image)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Whether the constants came from a valid image
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Throw away unsaved changes and read the stored constants again.
    pub fn reload(&mut self) -> anyhow::Result<()> {
        let path = self.path.take().ok_or(ConstError::NoStore)?;
        let fresh = Self::read(&path);
        self.path = Some(path);
        let fresh = fresh?;
        self.vars = fresh.vars;
        self.valid = fresh.valid;
        Ok(())
    }

    pub fn save(&mut self) -> anyhow::Result<()> {
        let path = self.path.as_ref().ok_or(ConstError::NoStore)?;
        let image = self.export()?;
        fs::write(path, image).with_context(|| format!("writing {}", path.display()))?;
        self.valid = true;
        Ok(())
    }

    pub fn getconst(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// `Some(true)` for values starting with `y`, `Y`, `1`, `t` or `T`, `None` if unset.
    pub fn getconst_yesno(&self, name: &str) -> Option<bool> {
        self.getconst(name)
            .map(|value| matches!(value.chars().next(), Some('y' | 'Y' | '1' | 't' | 'T')))
    }

    /// Set `name` to `values` joined by spaces, or delete it when `values` is empty.
    pub fn set(&mut self, name: &str, values: &[&str]) -> Result<(), ConstError> {
        if name.contains('=') {
            return Err(ConstError::IllegalName(name.to_string()));
        }
        if WRITE_ONCE.contains(&name) && self.vars.contains_key(name) {
            return Err(ConstError::ReadOnly(name.to_string()));
        }

        if values.is_empty() {
            return match self.vars.remove(name) {
                Some(_) => Ok(()),
                None => Err(ConstError::NotDefined(name.to_string())),
            };
        }

        self.vars.insert(name.to_string(), values.join(" "));
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Bytes the records take up in the data area
    pub fn used_bytes(&self) -> usize {
        self.vars.iter().map(|(k, v)| k.len() + v.len() + 2).sum()
    }

    /// Print every constant, sorted by name, followed by the space used.
    pub fn print_all(&self, out: &mut dyn Write) -> io::Result<()> {
        for (name, value) in self.iter() {
            writeln!(out, "{name}={value}")?;
        }
        writeln!(out, "\nConstants size: {}/{} bytes", self.used_bytes(), DATA_SIZE)
    }

    /// Print one constant as `name=value`.
    pub fn print(&self, name: &str, out: &mut dyn Write) -> anyhow::Result<()> {
        let value = self
            .getconst(name)
            .ok_or_else(|| ConstError::NotDefined(name.to_string()))?;
        writeln!(out, "{name}={value}")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_environment_text() -> anyhow::Result<()> {
        let mut env = Environment::parse("# saved\nbootlimit=6\n\nfit_config=a=b\n")?;
        assert_eq!(env.get("bootlimit"), Some("6"));
        assert_eq!(env.get("fit_config"), Some("a=b"));

        env.set_local("SFU_NUM_CHNKS", "0x00000001");
        assert_eq!(env.lookup("SFU_NUM_CHNKS"), Some("0x00000001"));
        assert_eq!(env.get("SFU_NUM_CHNKS"), None);

        // Locals are not persisted
        assert_eq!(env.to_text(), "bootlimit=6\nfit_config=a=b\n");
        assert!(Environment::parse("garbage").is_err());
        Ok(())
    }

    #[test]
    fn test_constants_image() -> anyhow::Result<()> {
        let mut constants = Constants::default();
        constants.set("key", &["abc", "def"])?;
        constants.set("serial#", &["1234"])?;

        let image = constants.export()?;
        assert_eq!(image.len(), CONSTANTS_SIZE);
        assert_eq!(&image[4..12], b"key=abc ");

        let imported = Constants::import(&image);
        assert!(imported.is_valid());
        assert_eq!(imported.getconst("key"), Some("abc def"));
        assert_eq!(imported.getconst("serial#"), Some("1234"));

        let mut corrupt = image.clone();
        corrupt[100] ^= 1;
        let imported = Constants::import(&corrupt);
        assert!(!imported.is_valid());
        assert!(imported.is_empty());
        Ok(())
    }

    #[test]
    fn test_constants_set() {
        let mut constants = Constants::default();
        assert_eq!(
            constants.set("a=b", &["x"]),
            Err(ConstError::IllegalName("a=b".into()))
        );

        assert_eq!(constants.set("mac", &["00:11:22:33:44:55"]), Ok(()));
        assert_eq!(constants.set("mac", &["x"]), Err(ConstError::ReadOnly("mac".into())));
        assert_eq!(constants.set("mac", &[]), Err(ConstError::ReadOnly("mac".into())));

        assert_eq!(constants.set("flag", &["yes"]), Ok(()));
        assert_eq!(constants.getconst_yesno("flag"), Some(true));
        assert_eq!(constants.getconst_yesno("nothing"), None);
        assert_eq!(constants.set("flag", &[]), Ok(()));
        assert_eq!(constants.set("flag", &[]), Err(ConstError::NotDefined("flag".into())));
    }

    #[test]
    fn test_constants_too_large() {
        let mut constants = Constants::default();
        let big = "x".repeat(DATA_SIZE);
        constants.vars.insert("big".into(), big);
        assert!(matches!(constants.export(), Err(ConstError::TooLarge(_))));
    }

    #[test]
    fn test_constants_print() -> anyhow::Result<()> {
        let mut constants = Constants::default();
        constants.set("b", &["2"])?;
        constants.set("a", &["1"])?;

        let mut out = Vec::new();
        constants.print_all(&mut out)?;
        let text = String::from_utf8(out)?;
        assert!(text.starts_with("a=1\nb=2\n\nConstants size: 8/"));

        let mut out = Vec::new();
        assert!(constants.print("c", &mut out).is_err());
        constants.print("b", &mut out)?;
        assert_eq!(out, b"b=2\n");
        Ok(())
    }
}
