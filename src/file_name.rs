//! Output file naming for runs, splits and streams.
//!
//! A base file name goes through two expansion steps:
//!
//! 1. [`generate_base_name`]: `$(ENV_VAR)` is replaced by the environment
//!    variable's value (or removed if unset) and `%s` by the run type.
//! 2. [`generate_file_name`]: up to two C-style integer specifiers (`%d`,
//!    `%x`, with optional width like `%03d`) are filled in. The first takes
//!    the run number. When splitting, the second takes the split number; if
//!    there is none, the split number is appended after a dot. When not
//!    splitting, an unused second specifier is dropped, and with multiple
//!    streams the stream id is appended instead so parallel writers never
//!    collide.
//!
//! A width without a leading zero gets one added, so generated names never
//! contain spaces.

use std::path::PathBuf;

use regex::Regex;

use crate::error::{EvioError, EvioResult};

/// Expand environment variables and the run type in a base file name and
/// count its integer format specifiers.
///
/// Fails if the name is empty after expansion or holds more than two
/// integer specifiers.
pub fn generate_base_name(
    base_name: &str,
    directory: &str,
    run_type: &str,
) -> EvioResult<(String, usize)> {
    if base_name.is_empty() {
        return Err(EvioError::Config("baseName arg is empty".into()));
    }

    #[allow(clippy::expect_used)] // the pattern is a literal, it compiles
    let env_re = Regex::new(r"\$\(([^)]+)\)").expect("static regex");
    let mut base = env_re
        .replace_all(base_name, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned();
    base = base.replace("%s", run_type);

    if base.is_empty() {
        return Err(EvioError::Config(
            "file name is empty after substitutions".into(),
        ));
    }

    let count = int_specifiers(&base)?.len();
    if count > 2 {
        return Err(EvioError::Config(format!(
            "base file name may hold at most 2 int specifiers, found {count}"
        )));
    }

    let full = if directory.is_empty() {
        base
    } else {
        format!("{directory}/{base}")
    };
    Ok((full, count))
}

/// One `%[0]width[dx]` occurrence in a base name.
struct IntSpecifier {
    start: usize,
    end: usize,
    width: usize,
    hex: bool,
}

impl IntSpecifier {
    fn format(&self, value: u32) -> String {
        match (self.hex, self.width) {
            (false, 0) => format!("{value}"),
            (false, w) => format!("{value:0w$}"),
            (true, 0) => format!("{value:x}"),
            (true, w) => format!("{value:0w$x}"),
        }
    }
}

fn int_specifiers(base: &str) -> EvioResult<Vec<IntSpecifier>> {
    #[allow(clippy::expect_used)] // the pattern is a literal, it compiles
    let re = Regex::new(r"%(\d*)([dx])").expect("static regex");
    let mut found = Vec::new();
    for caps in re.captures_iter(base) {
        let whole = caps.get(0).ok_or_else(|| {
            EvioError::Config("malformed int specifier in base file name".into())
        })?;
        let width_text = &caps[1];
        let width = if width_text.is_empty() {
            0
        } else {
            width_text.parse::<usize>().map_err(|_| {
                EvioError::Config(format!("bad specifier width in {base}"))
            })?
        };
        found.push(IntSpecifier {
            start: whole.start(),
            end: whole.end(),
            width,
            hex: &caps[2] == "x",
        });
    }
    Ok(found)
}

/// Produce one concrete file name from an expanded base name.
///
/// `specifier_count` is the count returned by [`generate_base_name`];
/// `splitting` says whether file splitting is enabled.
pub fn generate_file_name(
    base: &str,
    specifier_count: usize,
    run_number: u32,
    splitting: bool,
    split_number: u32,
    stream_id: u32,
    stream_count: u32,
) -> EvioResult<String> {
    let specs = int_specifiers(base)?;
    debug_assert_eq!(specs.len(), specifier_count);

    let mut name = String::with_capacity(base.len() + 8);
    let mut pos = 0;
    for (i, spec) in specs.iter().enumerate() {
        name.push_str(&base[pos..spec.start]);
        match i {
            0 => name.push_str(&spec.format(run_number)),
            1 if splitting => name.push_str(&spec.format(split_number)),
            // Unused second specifier when not splitting: drop it.
            _ => {}
        }
        pos = spec.end;
    }
    name.push_str(&base[pos..]);

    if splitting && specifier_count < 2 {
        name.push_str(&format!(".{split_number}"));
    } else if !splitting && stream_count > 1 {
        name.push_str(&format!(".{stream_id}"));
    }
    Ok(name)
}

/// Mutable naming state for one writer: hands out successive split file
/// names with monotonically increasing split numbers.
#[derive(Debug, Clone)]
pub struct FileNaming {
    base: String,
    specifier_count: usize,
    run_number: u32,
    splitting: bool,
    split_number: u32,
    split_increment: u32,
    stream_id: u32,
    stream_count: u32,
    split_count: u32,
}

impl FileNaming {
    /// Expand the base name once and capture the numbering inputs.
    pub fn new(
        base_name: &str,
        directory: &str,
        run_type: &str,
        run_number: u32,
        splitting: bool,
        split_number: u32,
        split_increment: u32,
        stream_id: u32,
        stream_count: u32,
    ) -> EvioResult<FileNaming> {
        let (base, specifier_count) = generate_base_name(base_name, directory, run_type)?;
        Ok(FileNaming {
            base,
            specifier_count,
            run_number: run_number.max(1),
            splitting,
            split_number,
            split_increment,
            stream_id,
            stream_count,
            split_count: 0,
        })
    }

    /// Name of the next file to create plus the split number it carries;
    /// advances the split number by the configured increment.
    pub fn next_path(&mut self) -> EvioResult<(PathBuf, u32)> {
        let used = self.split_number;
        let name = generate_file_name(
            &self.base,
            self.specifier_count,
            self.run_number,
            self.splitting,
            used,
            self.stream_id,
            self.stream_count,
        )?;
        self.split_number += self.split_increment;
        self.split_count += 1;
        Ok((PathBuf::from(name), used))
    }

    /// Split number the *next* file will carry.
    pub fn split_number(&self) -> u32 {
        self.split_number
    }

    /// Number of files named so far.
    pub fn split_count(&self) -> u32 {
        self.split_count
    }
}
