use std::path::{Component, Path};

use globset::{Glob, GlobBuilder, GlobMatcher};
use tracing::warn;

/// Decides which relative paths are left out of the synchronization.
pub trait IgnoreRules: Send + Sync + 'static {
	fn is_ignored(&self, relative_path: &Path, is_folder: bool) -> bool;
}

#[derive(Debug, Clone)]
struct Rule {
	matcher: GlobMatcher,
	folder_only: bool,
	negated: bool,
}

/// Ignore rules written with the usual gitignore syntax.
///
/// - `name` matches an entry with this name at any depth;
/// - `dir/name` or `/name` is anchored at the synchronized directory root;
/// - `name/` only matches folders;
/// - `!pattern` includes back what a previous rule ignored;
/// - an entry inside an ignored folder is always ignored.
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
	rules: Vec<Rule>,
}

impl IgnoreList {
	/// Build rules from lines, skipping blank lines, comments and invalid patterns.
	#[must_use]
	pub fn new<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
		Self {
			rules: lines.into_iter().filter_map(parse_rule).collect(),
		}
	}

	fn matches(&self, path: &str, is_folder: bool) -> bool {
		self.rules
			.iter()
			.filter(|rule| !rule.folder_only || is_folder)
			.fold(false, |ignored, rule| {
				if rule.matcher.is_match(path) {
					!rule.negated
				} else {
					ignored
				}
			})
	}
}

impl IgnoreRules for IgnoreList {
	fn is_ignored(&self, relative_path: &Path, is_folder: bool) -> bool {
		let mut current = String::new();
		let mut components = relative_path
			.components()
			.filter_map(|component| match component {
				Component::Normal(name) => Some(name.to_string_lossy()),
				_ => None,
			})
			.peekable();

		while let Some(name) = components.next() {
			if !current.is_empty() {
				current.push('/');
			}
			current.push_str(&name);

			let is_last = components.peek().is_none();
			if self.matches(&current, !is_last || is_folder) {
				return true;
			}
		}

		false
	}
}

fn parse_rule(line: &str) -> Option<Rule> {
	let line = line.trim_end();
	if line.is_empty() || line.starts_with('#') {
		return None;
	}

	let (negated, pattern) = line
		.strip_prefix('!')
		.map_or((false, line), |pattern| (true, pattern));

	let (folder_only, pattern) = pattern
		.strip_suffix('/')
		.map_or((false, pattern), |pattern| (true, pattern));

	let glob = if let Some(anchored) = pattern.strip_prefix('/') {
		anchored.to_string()
	} else if pattern.contains('/') {
		pattern.to_string()
	} else {
		format!("**/{pattern}")
	};

	match GlobBuilder::new(&glob)
		.literal_separator(true)
		.build()
		.map(|glob: Glob| glob.compile_matcher())
	{
		Ok(matcher) => Some(Rule {
			matcher,
			folder_only,
			negated,
		}),
		Err(e) => {
			warn!(?e, %line, "Skipping invalid ignore rule;");
			None
		}
	}
}
