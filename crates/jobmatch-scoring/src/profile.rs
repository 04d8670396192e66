use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use jobmatch_core::{normalize_whitespace, CandidateProfile, ErrorKind};
use jobmatch_storage::sha256_hex;
use thiserror::Error;
use tracing::debug;

/// Heading fragments that mark a skills section (matched case-insensitively).
const SKILL_HEADING_HINTS: &[&str] = &["skill", "tech", "tools", "competenc", "kompetens", "技能"];
const MAX_SKILL_CHARS: usize = 80;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("cannot read resume {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("resume has no skills section")]
    MissingSkills,
    #[error("skills section \"{heading}\" lists no skills")]
    EmptySkills { heading: String },
}

impl ProfileError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

pub fn profile_fingerprint(raw_text: &str) -> String {
    sha256_hex(raw_text.as_bytes())
}

/// Markdown resume reader. The last skills-like section wins.
#[derive(Debug, Clone)]
pub struct ProfileExtractor {
    heading_hints: Vec<String>,
}

impl Default for ProfileExtractor {
    fn default() -> Self {
        Self {
            heading_hints: SKILL_HEADING_HINTS.iter().map(|h| h.to_string()).collect(),
        }
    }
}

struct SkillSection<'a> {
    heading: &'a str,
    lines: Vec<&'a str>,
}

fn heading(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let title = trimmed[level..].trim().trim_end_matches('#').trim();
    if title.is_empty() {
        None
    } else {
        Some((level, title))
    }
}

fn skill_items(line: &str) -> Vec<String> {
    let line = line
        .trim()
        .trim_start_matches(['-', '*', '+', '•', '·'])
        .replace(['*', '`', '_'], "");
    // "Languages: Rust, Go" lists the part after the label.
    let line = match line.split_once(':') {
        Some((label, rest)) if label.chars().count() <= 40 && !label.contains(',') => rest.to_string(),
        _ => line,
    };
    line.split([',', ';', '|', '•', '·'])
        .map(|item| normalize_whitespace(item).trim_end_matches('.').to_lowercase())
        .filter(|item| !item.is_empty() && item.chars().count() <= MAX_SKILL_CHARS)
        .collect()
}

impl ProfileExtractor {
    fn is_skill_heading(&self, title: &str) -> bool {
        let lower = title.to_lowercase();
        self.heading_hints.iter().any(|hint| lower.contains(hint.as_str()))
    }

    fn last_skill_section<'a>(&self, text: &'a str) -> Option<SkillSection<'a>> {
        let mut last = None;
        let mut current: Option<(usize, SkillSection<'a>)> = None;

        for line in text.lines() {
            if let Some((level, title)) = heading(line) {
                if let Some((open_level, _)) = &current {
                    if level <= *open_level {
                        last = current.take().map(|(_, section)| section);
                    } else {
                        // nested sub-heading inside the skills section
                        continue;
                    }
                }
                if self.is_skill_heading(title) {
                    current = Some((level, SkillSection { heading: title, lines: Vec::new() }));
                }
                continue;
            }
            if let Some((_, section)) = current.as_mut() {
                section.lines.push(line);
            }
        }
        current.map(|(_, section)| section).or(last)
    }

    pub fn extract(&self, raw_text: &str) -> Result<CandidateProfile, ProfileError> {
        let section = self.last_skill_section(raw_text).ok_or(ProfileError::MissingSkills)?;
        let skills: BTreeSet<String> = section.lines.iter().flat_map(|line| skill_items(line)).collect();
        if skills.is_empty() {
            return Err(ProfileError::EmptySkills {
                heading: section.heading.to_string(),
            });
        }
        debug!(heading = section.heading, skills = skills.len(), "skills extracted");
        Ok(CandidateProfile::new(
            skills,
            raw_text.to_string(),
            profile_fingerprint(raw_text),
        ))
    }

    pub async fn load(&self, path: &Path) -> Result<CandidateProfile, ProfileError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|source| ProfileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.extract(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESUME: &str = "\
# Ada Svensson

## Experience
- Built payment systems in Rust at Nordbank (2019-2024).

## Skills
- Python, Excel

## Education
MSc Computer Science, KTH

## Technical Skills
### Languages
- **Rust**, Go; TypeScript
- Databases: PostgreSQL | Redis
* Kubernetes.
";

    #[test]
    fn last_skills_section_wins() {
        let profile = ProfileExtractor::default().extract(RESUME).unwrap();
        let skills: Vec<_> = profile.skills.iter().map(String::as_str).collect();
        assert_eq!(skills, vec!["go", "kubernetes", "postgresql", "redis", "rust", "typescript"]);
        assert_eq!(profile.raw_text, RESUME);
    }

    #[test]
    fn skills_section_ends_at_the_next_peer_heading() {
        let text = "## Skills\n- Rust\n## Projects\n- a CLI, a web app\n";
        let profile = ProfileExtractor::default().extract(text).unwrap();
        assert_eq!(profile.skills_list(), vec!["rust".to_string()]);
    }

    #[test]
    fn fingerprint_tracks_resume_content() {
        let extractor = ProfileExtractor::default();
        let a = extractor.extract(RESUME).unwrap();
        let b = extractor.extract(RESUME).unwrap();
        let edited = extractor.extract(&format!("{RESUME}\n- Terraform\n")).unwrap();
        assert_eq!(a.profile_fingerprint, b.profile_fingerprint);
        assert_ne!(a.profile_fingerprint, edited.profile_fingerprint);
        assert_eq!(a.profile_fingerprint.len(), 64);
    }

    #[test]
    fn missing_or_empty_skills_is_a_config_error() {
        let extractor = ProfileExtractor::default();
        let missing = extractor.extract("# Me\n## Experience\n- things\n").unwrap_err();
        assert!(matches!(missing, ProfileError::MissingSkills));
        assert_eq!(missing.kind(), ErrorKind::Config);

        let empty = extractor.extract("## Skills\n\n## Education\nKTH\n").unwrap_err();
        assert!(matches!(empty, ProfileError::EmptySkills { .. }));
    }

    #[tokio::test]
    async fn unreadable_resume_is_reported_with_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.md");
        let err = ProfileExtractor::default().load(&path).await.unwrap_err();
        assert!(matches!(err, ProfileError::Read { .. }));
        assert!(err.to_string().contains("missing.md"));
    }
}
