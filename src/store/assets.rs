//! `assets.json` parsing and path resolution
//!
//! An `assets.json` file lives somewhere inside a language repository and
//! pins the recordings for that directory to a tag or commit of a separate
//! assets repository.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{ProxyError, Result};

/// File name looked up when a directory is given
pub const ASSETS_JSON: &str = "assets.json";

/// Folder under the repository root holding clones and the breadcrumb log
pub const ASSETS_FOLDER: &str = ".assets";

#[derive(Debug, Default, Deserialize)]
struct AssetsJson {
    #[serde(rename = "AssetsRepo", default)]
    assets_repo: Option<String>,
    #[serde(rename = "AssetsRepoPrefixPath", default)]
    assets_repo_prefix_path: Option<String>,
    #[serde(rename = "AssetsRepoId", default)]
    assets_repo_id: Option<String>,
    #[serde(rename = "AssetsRepoBranch", default)]
    assets_repo_branch: Option<String>,
    #[serde(rename = "TagPrefix", default)]
    tag_prefix: Option<String>,
    #[serde(rename = "Tag", default)]
    tag: Option<String>,
    #[serde(rename = "SHA", default)]
    sha: Option<String>,
}

/// Parsed and resolved `assets.json`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitAssetsConfiguration {
    /// Absolute path of the `assets.json` file
    pub assets_json_path: PathBuf,
    /// Nearest ancestor directory containing `.git`
    pub repo_root: PathBuf,
    /// `assets.json` path relative to `repo_root`
    pub assets_json_relative_path: PathBuf,
    /// Assets repository, `owner/name`
    pub assets_repo: String,
    /// Path prefix inside the assets repository
    pub assets_repo_prefix_path: String,
    /// Optional identifier used for the default push branch
    pub assets_repo_id: String,
    /// Branch pushed to, empty for the automatic branch
    pub assets_repo_branch: String,
    /// Prefix for tags created on push, empty for no tag
    pub tag_prefix: String,
    /// Symbolic tag, used when no SHA is pinned
    pub tag: String,
    /// Pinned commit
    pub sha: String,
}

fn non_blank(value: Option<String>) -> String {
    value.map(|v| v.trim().to_string()).unwrap_or_default()
}

impl GitAssetsConfiguration {
    /// Load the configuration for `path`, an `assets.json` file or its directory
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` if the file is missing, empty, lacks
    /// `AssetsRepo` or is not inside a git repository
    pub fn load(path: &Path) -> Result<Self> {
        let assets_json_path = if path.is_dir() {
            path.join(ASSETS_JSON)
        } else {
            path.to_path_buf()
        };

        if !assets_json_path.is_file() {
            return Err(ProxyError::BadRequest(format!(
                "The provided assets.json path of {} does not exist.",
                path.display()
            )));
        }
        let assets_json_path = assets_json_path.canonicalize()?;

        let raw = std::fs::read_to_string(&assets_json_path)?;
        let stripped = strip_comments(&raw);
        let invalid = || {
            ProxyError::BadRequest(format!(
                "The provided assets.json at {} did not have valid json present.",
                assets_json_path.display()
            ))
        };

        let value: serde_json::Value = serde_json::from_str(&stripped).map_err(|_| invalid())?;
        if value.as_object().map_or(true, serde_json::Map::is_empty) {
            return Err(invalid());
        }
        let parsed: AssetsJson = serde_json::from_value(value).map_err(|_| invalid())?;

        let assets_repo = non_blank(parsed.assets_repo);
        if assets_repo.is_empty() {
            return Err(ProxyError::BadRequest(format!(
                "Unable to utilize the assets.json present at {}. It must contain value for the key \"AssetsRepo\" to be considered a valid assets.json file.",
                assets_json_path.display()
            )));
        }

        let repo_root = find_repo_root(&assets_json_path).ok_or_else(|| {
            ProxyError::BadRequest(format!(
                "The assets.json at {} is not located within a git repository.",
                assets_json_path.display()
            ))
        })?;
        let assets_json_relative_path = assets_json_path
            .strip_prefix(&repo_root)
            .map(Path::to_path_buf)
            .map_err(|e| ProxyError::Other(format!("Unable to relativize assets.json: {e}")))?;

        Ok(Self {
            assets_json_path,
            repo_root,
            assets_json_relative_path,
            assets_repo,
            assets_repo_prefix_path: non_blank(parsed.assets_repo_prefix_path),
            assets_repo_id: non_blank(parsed.assets_repo_id),
            assets_repo_branch: non_blank(parsed.assets_repo_branch),
            tag_prefix: non_blank(parsed.tag_prefix),
            tag: non_blank(parsed.tag),
            sha: non_blank(parsed.sha),
        })
    }

    /// Name of the clone folder shared by every `assets.json` with the same repo, prefix and branch
    #[must_use]
    pub fn clone_folder_name(&self) -> String {
        let key = format!(
            "{}|{}|{}",
            self.assets_repo, self.assets_repo_prefix_path, self.assets_repo_branch
        );
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        digest[..10].to_string()
    }

    /// Directory holding the assets repository clone
    #[must_use]
    pub fn assets_repo_location(&self) -> PathBuf {
        self.repo_root
            .join(ASSETS_FOLDER)
            .join(self.clone_folder_name())
    }

    /// Shared breadcrumb log
    #[must_use]
    pub fn breadcrumb_path(&self) -> PathBuf {
        self.repo_root.join(ASSETS_FOLDER).join("breadcrumb.log")
    }

    /// Path inside the assets repository that mirrors the `assets.json` directory
    #[must_use]
    pub fn checkout_path(&self) -> String {
        let relative_dir = self
            .assets_json_relative_path
            .parent()
            .map(|dir| dir.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        let parts: Vec<&str> = [self.assets_repo_prefix_path.as_str(), relative_dir.as_str()]
            .into_iter()
            .map(|part| part.trim_matches('/'))
            .filter(|part| !part.is_empty())
            .collect();
        if parts.is_empty() {
            "./".to_string()
        } else {
            parts.join("/")
        }
    }

    /// Directory recordings resolve against once restored
    #[must_use]
    pub fn recordings_root(&self) -> PathBuf {
        let checkout = self.checkout_path();
        let location = self.assets_repo_location();
        if checkout == "./" {
            location
        } else {
            location.join(checkout)
        }
    }

    /// Clone URL for the assets repository
    #[must_use]
    pub fn clone_url(&self, remote_base: &str) -> String {
        if self.assets_repo.contains("://") {
            return self.assets_repo.clone();
        }
        format!("{}/{}", remote_base.trim_end_matches('/'), self.assets_repo)
    }

    /// Branch pushed to
    #[must_use]
    pub fn push_branch(&self) -> String {
        if !self.assets_repo_branch.is_empty() {
            return self.assets_repo_branch.clone();
        }
        let id = if self.assets_repo_id.is_empty() {
            self.clone_folder_name()
        } else {
            self.assets_repo_id.clone()
        };
        format!("auto/{id}")
    }

    /// The ref restore should check out, SHA first
    #[must_use]
    pub fn target_ref(&self) -> Option<&str> {
        [self.sha.as_str(), self.tag.as_str()]
            .into_iter()
            .find(|value| !value.is_empty())
    }

    /// Pin a new SHA (and optionally tag) in the `assets.json` text.
    ///
    /// Only the value text changes; formatting and comments are kept. Returns
    /// whether the file was written.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or written
    pub fn update_pins(&mut self, sha: &str, tag: Option<&str>) -> Result<bool> {
        if self.sha == sha && tag.map_or(true, |t| t == self.tag) {
            return Ok(false);
        }

        let mut text = std::fs::read_to_string(&self.assets_json_path)?;
        text = set_string_value(&text, "SHA", sha)?;
        if let Some(tag) = tag {
            text = set_string_value(&text, "Tag", tag)?;
        }
        std::fs::write(&self.assets_json_path, text)?;

        self.sha = sha.to_string();
        if let Some(tag) = tag {
            self.tag = tag.to_string();
        }
        Ok(true)
    }
}

fn find_repo_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .skip(1)
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

fn key_regex(key: &str) -> Result<Regex> {
    let escaped = regex::escape(key);
    Regex::new(&format!(r#"("{escaped}"\s*:\s*")([^"]*)(")"#))
        .map_err(|e| ProxyError::Other(format!("Invalid key pattern for {key}: {e}")))
}

fn set_string_value(text: &str, key: &str, value: &str) -> Result<String> {
    let regex = key_regex(key)?;
    if regex.is_match(text) {
        return Ok(regex
            .replacen(text, 1, |caps: &regex::Captures| {
                format!("{}{}{}", &caps[1], value, &caps[3])
            })
            .into_owned());
    }

    Ok(match text.find('{') {
        Some(index) => format!(
            "{}\n  \"{key}\": \"{value}\",{}",
            &text[..=index],
            &text[index + 1..]
        ),
        None => text.to_string(),
    })
}

/// Remove `//` and `/* */` comments outside of string literals
#[must_use]
pub fn strip_comments(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            output.push(c);
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        output.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                output.push(c);
            }
            ('/', Some('/')) => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        output.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut previous = '\0';
                for next in chars.by_ref() {
                    if previous == '*' && next == '/' {
                        break;
                    }
                    previous = next;
                }
            }
            _ => output.push(c),
        }
    }
    output
}
