//! Open-flag strings and access masks.

use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;

use bitflags::bitflags;

use crate::errno::Errno;
use crate::errno::FsError;
use crate::errno::Result;

bitflags! {
    /// The rwx mask a caller must satisfy against one permission class of
    /// a node's mode.
    ///
    /// [`Vfs::access`](crate::Vfs::access) takes this directly;
    /// [`OpenFlag::access_mask`] derives it from an open flag, and
    /// [`Stats::has_access`](crate::Stats::has_access) clears the bits the
    /// caller's class grants and requires the rest to be empty.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct AccessFlags: i32 {
        /// Existence only; the zero mask, satisfied by any node.
        const F_OK = libc::F_OK;
        /// The caller needs the read bit of its class.
        const R_OK = libc::R_OK;
        /// The caller needs the write bit of its class.
        const W_OK = libc::W_OK;
        /// The caller needs the execute/search bit of its class.
        const X_OK = libc::X_OK;
    }
}

impl Display for AccessFlags {
    /// Symbolic `rwx` form, `-` for existence-only.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        if self.contains(AccessFlags::R_OK) {
            f.write_str("r")?;
        }
        if self.contains(AccessFlags::W_OK) {
            f.write_str("w")?;
        }
        if self.contains(AccessFlags::X_OK) {
            f.write_str("x")?;
        }
        Ok(())
    }
}

/// A parsed open-flag string.
///
/// The accepted strings are `r`, `rs`, `r+`, `w`, `wx`, `w+`, `wx+`, `a`,
/// `ax`, `a+`, `ax+` with the usual POSIX semantics; the `x+`/`+x` spellings
/// are interchangeable.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct OpenFlag {
    /// Reads are permitted.
    pub readable: bool,
    /// Writes are permitted.
    pub writable: bool,
    /// Writes always land at the end of the file.
    pub appendable: bool,
    /// The file is truncated to zero length on open.
    pub truncate: bool,
    /// Open fails with `EEXIST` if the file already exists.
    pub exclusive: bool,
    /// The file is created if missing.
    pub create: bool,
}

impl OpenFlag {
    /// Parse a flag string. Unknown strings fail with `EINVAL`.
    pub fn parse(flag: &str) -> Result<Self> {
        let parsed = match flag {
            "r" | "rs" => OpenFlag {
                readable: true,
                writable: false,
                appendable: false,
                truncate: false,
                exclusive: false,
                create: false,
            },
            "r+" => OpenFlag {
                readable: true,
                writable: true,
                appendable: false,
                truncate: false,
                exclusive: false,
                create: false,
            },
            "w" => OpenFlag {
                readable: false,
                writable: true,
                appendable: false,
                truncate: true,
                exclusive: false,
                create: true,
            },
            "wx" | "xw" => OpenFlag {
                readable: false,
                writable: true,
                appendable: false,
                truncate: true,
                exclusive: true,
                create: true,
            },
            "w+" => OpenFlag {
                readable: true,
                writable: true,
                appendable: false,
                truncate: true,
                exclusive: false,
                create: true,
            },
            "wx+" | "w+x" => OpenFlag {
                readable: true,
                writable: true,
                appendable: false,
                truncate: true,
                exclusive: true,
                create: true,
            },
            "a" => OpenFlag {
                readable: false,
                writable: true,
                appendable: true,
                truncate: false,
                exclusive: false,
                create: true,
            },
            "ax" | "xa" => OpenFlag {
                readable: false,
                writable: true,
                appendable: true,
                truncate: false,
                exclusive: true,
                create: true,
            },
            "a+" => OpenFlag {
                readable: true,
                writable: true,
                appendable: true,
                truncate: false,
                exclusive: false,
                create: true,
            },
            "ax+" | "a+x" => OpenFlag {
                readable: true,
                writable: true,
                appendable: true,
                truncate: false,
                exclusive: true,
                create: true,
            },
            _ => {
                return Err(FsError::new(Errno::EINVAL).with_syscall("open"));
            }
        };
        Ok(parsed)
    }

    /// The access mask an open with this flag must satisfy on an existing
    /// file.
    pub fn access_mask(self) -> AccessFlags {
        match (self.readable, self.writable) {
            (true, true) => AccessFlags::R_OK | AccessFlags::W_OK,
            (true, false) => AccessFlags::R_OK,
            (false, _) => AccessFlags::W_OK,
        }
    }

    /// True if the flag can create the file when it is missing. `r+` never
    /// creates, so an open of a missing file with it fails `ENOENT`.
    pub fn may_create(self) -> bool {
        self.create && (self.writable || self.appendable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_table() {
        // (flag, readable, writable, appendable, truncate, exclusive, create)
        let table = [
            ("r", true, false, false, false, false, false),
            ("rs", true, false, false, false, false, false),
            ("r+", true, true, false, false, false, false),
            ("w", false, true, false, true, false, true),
            ("wx", false, true, false, true, true, true),
            ("w+", true, true, false, true, false, true),
            ("wx+", true, true, false, true, true, true),
            ("a", false, true, true, false, false, true),
            ("ax", false, true, true, false, true, true),
            ("a+", true, true, true, false, false, true),
            ("ax+", true, true, true, false, true, true),
        ];
        for (s, readable, writable, appendable, truncate, exclusive, create) in table {
            let f = OpenFlag::parse(s).unwrap();
            assert_eq!(f.readable, readable, "{s} readable");
            assert_eq!(f.writable, writable, "{s} writable");
            assert_eq!(f.appendable, appendable, "{s} appendable");
            assert_eq!(f.truncate, truncate, "{s} truncate");
            assert_eq!(f.exclusive, exclusive, "{s} exclusive");
            assert_eq!(f.create, create, "{s} create");
        }
    }

    #[test]
    fn bad_flag_is_einval() {
        let err = OpenFlag::parse("rw").unwrap_err();
        assert_eq!(err.errno, Errno::EINVAL);
        assert!(OpenFlag::parse("").is_err());
    }

    #[test]
    fn access_mask_renders_symbolically() {
        assert_eq!(AccessFlags::F_OK.to_string(), "-");
        assert_eq!(AccessFlags::W_OK.to_string(), "w");
        assert_eq!(
            (AccessFlags::R_OK | AccessFlags::W_OK | AccessFlags::X_OK).to_string(),
            "rwx"
        );
    }

    #[test]
    fn access_masks() {
        assert_eq!(OpenFlag::parse("r").unwrap().access_mask(), AccessFlags::R_OK);
        assert_eq!(OpenFlag::parse("w").unwrap().access_mask(), AccessFlags::W_OK);
        assert_eq!(
            OpenFlag::parse("r+").unwrap().access_mask(),
            AccessFlags::R_OK | AccessFlags::W_OK
        );
    }

    #[test]
    fn r_plus_does_not_create() {
        assert!(!OpenFlag::parse("r+").unwrap().may_create());
        assert!(OpenFlag::parse("w").unwrap().may_create());
    }
}
