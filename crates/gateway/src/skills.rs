//! Skill discovery: scan `skills/*/SKILL.md` frontmatter and regenerate the
//! `SKILLS_SNAPSHOT.md` the prompt builder injects.

use std::path::Path;

use serde::Serialize;

use warren_domain::Result;

#[derive(Clone, Debug, Serialize)]
pub struct SkillMeta {
    pub name: String,
    pub description: String,
    pub location: String,
}

/// Parse a `---`-fenced frontmatter block into key/value pairs. Only the
/// simple `key: value` lines skills actually use are supported.
fn extract_frontmatter(text: &str) -> Vec<(String, String)> {
    let mut lines = text.lines();
    if lines.next().map(str::trim) != Some("---") {
        return Vec::new();
    }
    let mut pairs = Vec::new();
    for line in lines {
        if line.trim() == "---" {
            return pairs;
        }
        if let Some((key, value)) = line.split_once(':') {
            pairs.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    Vec::new()
}

fn frontmatter_get(pairs: &[(String, String)], key: &str) -> Option<String> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Scan the skills directory and rewrite `SKILLS_SNAPSHOT.md` at the base.
pub fn scan_skills(base_dir: &Path) -> Result<Vec<SkillMeta>> {
    let skills_dir = base_dir.join("skills");
    let mut found = Vec::new();

    if skills_dir.is_dir() {
        let mut dirs: Vec<_> = std::fs::read_dir(&skills_dir)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();
        for dir in dirs {
            let skill_file = dir.join("SKILL.md");
            let Ok(text) = std::fs::read_to_string(&skill_file) else {
                continue;
            };
            let pairs = extract_frontmatter(&text);
            let dir_name = dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("skill")
                .to_string();
            found.push(SkillMeta {
                name: frontmatter_get(&pairs, "name").unwrap_or_else(|| dir_name.clone()),
                description: frontmatter_get(&pairs, "description").unwrap_or_default(),
                location: format!("./skills/{dir_name}/SKILL.md"),
            });
        }
    }

    let mut lines = vec!["<available_skills>".to_string()];
    for skill in &found {
        lines.push("  <skill>".into());
        lines.push(format!("    <name>{}</name>", xml_escape(&skill.name)));
        lines.push(format!(
            "    <description>{}</description>",
            xml_escape(&skill.description)
        ));
        lines.push(format!(
            "    <location>{}</location>",
            xml_escape(&skill.location)
        ));
        lines.push("  </skill>".into());
    }
    lines.push("</available_skills>".into());
    std::fs::write(base_dir.join("SKILLS_SNAPSHOT.md"), lines.join("\n") + "\n")?;

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_frontmatter_and_writes_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let skill_dir = dir.path().join("skills/weather");
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(
            skill_dir.join("SKILL.md"),
            "---\nname: weather\ndescription: Fetch a forecast\n---\nbody\n",
        )
        .unwrap();

        let skills = scan_skills(dir.path()).unwrap();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "weather");
        assert_eq!(skills[0].description, "Fetch a forecast");

        let snapshot = std::fs::read_to_string(dir.path().join("SKILLS_SNAPSHOT.md")).unwrap();
        assert!(snapshot.contains("<name>weather</name>"));
    }

    #[test]
    fn missing_frontmatter_falls_back_to_directory_name() {
        let dir = tempfile::TempDir::new().unwrap();
        let skill_dir = dir.path().join("skills/plain");
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(skill_dir.join("SKILL.md"), "no frontmatter here\n").unwrap();

        let skills = scan_skills(dir.path()).unwrap();
        assert_eq!(skills[0].name, "plain");
        assert!(skills[0].description.is_empty());
    }

    #[test]
    fn empty_skills_dir_writes_empty_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let skills = scan_skills(dir.path()).unwrap();
        assert!(skills.is_empty());
        let snapshot = std::fs::read_to_string(dir.path().join("SKILLS_SNAPSHOT.md")).unwrap();
        assert_eq!(snapshot, "<available_skills>\n</available_skills>\n");
    }
}
