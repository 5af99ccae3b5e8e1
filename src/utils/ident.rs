//! Identity and shell-safety checks for values interpolated into container
//! commands (repository names, commits, repository-relative paths).

/// Validate a git ref (commit SHA, branch or tag name).
///
/// Accepts alphanumerics plus `/ . - _ ~ ^`. Rejects shell metacharacters,
/// `..` sequences and refs starting with `-` (flag injection).
pub fn validate_git_ref(s: &str) -> Result<(), anyhow::Error> {
    if s.is_empty() {
        anyhow::bail!("git ref is empty");
    }
    if s.len() > 256 {
        anyhow::bail!("git ref too long ({} chars, max 256)", s.len());
    }
    if s.starts_with('-') {
        anyhow::bail!("git ref '{}' must not start with '-'", s);
    }
    if s.contains("..") {
        anyhow::bail!("git ref '{}' must not contain '..'", s);
    }
    if let Some(ch) = s
        .chars()
        .find(|ch| !matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '/' | '.' | '-' | '_' | '~' | '^'))
    {
        anyhow::bail!("invalid character '{}' in git ref '{}'", ch, s);
    }
    Ok(())
}

/// Validate a repository name in `owner/repo` form.
pub fn validate_repo_name(s: &str) -> Result<(), anyhow::Error> {
    if s.is_empty() {
        anyhow::bail!("repository name is empty");
    }
    if s.len() > 256 {
        anyhow::bail!("repository name too long ({} chars, max 256)", s.len());
    }
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() != 2 {
        anyhow::bail!("invalid repository name '{}': expected 'owner/repo'", s);
    }
    for part in &parts {
        if part.is_empty() {
            anyhow::bail!("invalid repository name '{}': empty owner or repo", s);
        }
        if part.starts_with('.') || part.starts_with('-') {
            anyhow::bail!(
                "invalid repository name '{}': parts must not start with '.' or '-'",
                s
            );
        }
        if let Some(ch) = part
            .chars()
            .find(|ch| !matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.'))
        {
            anyhow::bail!("invalid character '{}' in repository name '{}'", ch, s);
        }
    }
    Ok(())
}

/// Validate a repository-relative path used inside a probe command.
pub fn validate_file_path(path: &str) -> Result<(), anyhow::Error> {
    if path.is_empty() {
        anyhow::bail!("file path is empty");
    }
    if path.len() > 4096 {
        anyhow::bail!("file path too long ({} chars, max 4096)", path.len());
    }
    if path.contains('\0') {
        anyhow::bail!("file path contains null byte");
    }
    if path.split('/').any(|seg| seg == "..") {
        anyhow::bail!("file path '{}' contains '..' (path traversal)", path);
    }
    if path.starts_with('/') {
        anyhow::bail!("file path '{}' must be relative", path);
    }
    if let Some(ch) = path.chars().find(|ch| {
        matches!(
            ch,
            '\'' | '"' | '`' | '$' | '!' | '&' | '|' | ';' | '(' | ')' | '{' | '}' | '<' | '>'
                | '\\' | '\n' | '\r'
        )
    }) {
        anyhow::bail!(
            "invalid character '{}' in file path '{}': shell metacharacters not allowed",
            ch,
            path
        );
    }
    Ok(())
}

/// Instance id used when a record does not carry one: `owner__repo-<commit12>`.
pub fn derive_instance_id(repo: &str, base_commit: &str) -> String {
    let short: String = base_commit.chars().take(12).collect();
    format!("{}-{}", repo.replace('/', "__"), short)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_git_ref_accepts_shas_and_names() {
        assert!(validate_git_ref("abc123def456").is_ok());
        assert!(validate_git_ref("a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2").is_ok());
        assert!(validate_git_ref("feature/my-branch").is_ok());
        assert!(validate_git_ref("v1.2.3").is_ok());
    }

    #[test]
    fn validate_git_ref_rejects_injection() {
        assert!(validate_git_ref("").is_err());
        assert!(validate_git_ref("abc123; rm -rf /").is_err());
        assert!(validate_git_ref("$(whoami)").is_err());
        assert!(validate_git_ref("main..HEAD").is_err());
        assert!(validate_git_ref("--exec=whoami").is_err());
        assert!(validate_git_ref(&"a".repeat(257)).is_err());
    }

    #[test]
    fn validate_repo_name_cases() {
        assert!(validate_repo_name("owner/repo").is_ok());
        assert!(validate_repo_name("user123/project.js").is_ok());
        assert!(validate_repo_name("noslash").is_err());
        assert!(validate_repo_name("too/many/slashes").is_err());
        assert!(validate_repo_name("owner/").is_err());
        assert!(validate_repo_name(".hidden/repo").is_err());
        assert!(validate_repo_name("owner/repo && echo pwned").is_err());
    }

    #[test]
    fn validate_file_path_cases() {
        assert!(validate_file_path("tests/test_foo.py").is_ok());
        assert!(validate_file_path("pkg..name/file.txt").is_ok());
        assert!(validate_file_path("../etc/passwd").is_err());
        assert!(validate_file_path("a/../../etc").is_err());
        assert!(validate_file_path("/etc/passwd").is_err());
        assert!(validate_file_path("file$(whoami)").is_err());
        assert!(validate_file_path("file;ls").is_err());
        assert!(validate_file_path("file\0.txt").is_err());
        assert!(validate_file_path("").is_err());
    }

    #[test]
    fn derive_instance_id_format() {
        assert_eq!(
            derive_instance_id("psf/requests", "0123456789abcdef0123"),
            "psf__requests-0123456789ab"
        );
        assert_eq!(derive_instance_id("a/b", "abc"), "a__b-abc");
    }
}
