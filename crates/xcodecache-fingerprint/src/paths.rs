//! Path normalization for fingerprint pre-images.

use std::path::Path;

/// Strip the working directory out of `s` so pre-images carry no absolute
/// paths from the machine that produced them: `{cwd}/` disappears entirely,
/// and `{cwd}` followed by a non-word character collapses to that character.
pub fn strip_pwd(s: &str, cwd: &Path) -> String {
    let cwd = cwd.to_string_lossy();
    let cwd = cwd.trim_end_matches('/');
    if cwd.is_empty() {
        return s.to_string();
    }

    let pass_one = s.replace(&format!("{cwd}/"), "");

    let mut out = String::with_capacity(pass_one.len());
    let mut rest = pass_one.as_str();
    while let Some(idx) = rest.find(cwd) {
        let after = &rest[idx + cwd.len()..];
        match after.chars().next() {
            Some(c) if !(c.is_ascii_alphanumeric() || c == '_') => {
                out.push_str(&rest[..idx]);
            }
            _ => {
                out.push_str(&rest[..idx + cwd.len()]);
            }
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_cwd_prefix_with_slash() {
        assert_eq!(
            strip_pwd("/repo/app/Pods/AF/AF.swift", Path::new("/repo/app")),
            "Pods/AF/AF.swift"
        );
    }

    #[test]
    fn keeps_the_non_word_boundary_character() {
        assert_eq!(
            strip_pwd("dir=/repo/app;next", Path::new("/repo/app")),
            "dir=;next"
        );
    }

    #[test]
    fn does_not_split_longer_path_components() {
        // /repo/app2 is a different directory, not cwd followed by junk.
        assert_eq!(
            strip_pwd("/repo/app2/file", Path::new("/repo/app")),
            "/repo/app2/file"
        );
    }

    #[test]
    fn handles_multiple_occurrences() {
        assert_eq!(
            strip_pwd("-I/w/x -F/w/x/Frameworks", Path::new("/w/x")),
            "-I -FFrameworks"
        );
    }
}
