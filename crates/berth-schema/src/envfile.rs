//! Parser for the `KEY=value` side-car files referenced by compose manifests.
//!
//! The comment line directly above a pair describes it. Trailing markers on
//! that comment carry flags: ` M` marks the variable mutable, ` U` makes the
//! value its declared default, ` MU` / ` UM` set both.

use crate::description::{DescriptionError, EnvDeclaration};

pub fn parse_env_file(file: &str, content: &str) -> Result<Vec<EnvDeclaration>, DescriptionError> {
    let mut declarations = Vec::new();
    let mut comment: Option<&str> = None;

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            comment = None;
            continue;
        }
        if let Some(text) = line.strip_prefix('#') {
            comment = Some(text.trim());
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(DescriptionError::EnvFile {
                file: file.to_owned(),
                line: idx + 1,
                content: line.to_owned(),
            });
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(DescriptionError::EnvFile {
                file: file.to_owned(),
                line: idx + 1,
                content: line.to_owned(),
            });
        }

        let (description, mutable, use_value) = split_markers(comment.take().unwrap_or(""));
        declarations.push(EnvDeclaration {
            name: key.to_owned(),
            description: description.to_owned(),
            mutable,
            private: false,
            default: use_value.then(|| value.trim().to_owned()),
        });
    }

    Ok(declarations)
}

fn split_markers(comment: &str) -> (&str, bool, bool) {
    for (suffix, mutable, use_value) in [
        (" MU", true, true),
        (" UM", true, true),
        (" M", true, false),
        (" U", false, true),
    ] {
        if let Some(rest) = comment.strip_suffix(suffix) {
            return (rest.trim_end(), mutable, use_value);
        }
    }
    (comment, false, false)
}
