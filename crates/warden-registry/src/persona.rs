//! Personas: the file sets that define agents.

use serde::{Deserialize, Serialize};
use warden_crypto::ContentHash;

/// Filenames composed first into the system prompt, in this order.
/// Remaining files follow alphabetically.
const PRIORITY_FILES: [&str; 4] = ["SOUL.md", "IDENTITY.md", "TOOLS.md", "MEMORY.md"];

/// Delimiter between persona sections in the compiled prompt.
const SECTION_DELIMITER: &str = "\n\n---\n\n";

/// A single persona file (e.g. `SOUL.md`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaFile {
    /// File name.
    pub filename: String,
    /// File content.
    pub content: String,
}

impl PersonaFile {
    /// Create a persona file.
    pub fn new(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }

    /// SHA-256 of the file content, hex-encoded.
    #[must_use]
    pub fn content_hash(&self) -> String {
        ContentHash::hash(self.content.as_bytes()).to_hex()
    }
}

/// A complete persona: the ordered set of files defining one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    /// The persona files.
    pub files: Vec<PersonaFile>,
}

impl Persona {
    /// Build a persona from files.
    #[must_use]
    pub fn new(files: Vec<PersonaFile>) -> Self {
        Self { files }
    }

    /// The canonical persona hash.
    ///
    /// Files are sorted by name, each contributes
    /// `filename:content_hash`, the parts are joined with `|`, and
    /// the whole string is hashed. Input order never matters; adding,
    /// removing or renaming any file changes the hash.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let mut sorted: Vec<&PersonaFile> = self.files.iter().collect();
        sorted.sort_by(|a, b| a.filename.cmp(&b.filename));

        let combined: Vec<String> = sorted
            .iter()
            .map(|f| format!("{}:{}", f.filename, f.content_hash()))
            .collect();
        ContentHash::hash(combined.join("|").as_bytes()).to_hex()
    }

    /// Compose the persona files into a system prompt.
    ///
    /// `SOUL.md`, `IDENTITY.md`, `TOOLS.md` and `MEMORY.md` come
    /// first in that order; everything else follows alphabetically.
    #[must_use]
    pub fn compile_system_prompt(&self) -> String {
        let mut sorted: Vec<&PersonaFile> = self.files.iter().collect();
        sorted.sort_by_key(|f| {
            PRIORITY_FILES
                .iter()
                .position(|p| *p == f.filename)
                .map_or((1, f.filename.clone()), |idx| (0, format!("{idx}")))
        });

        let sections: Vec<String> = sorted
            .iter()
            .map(|f| format!("## {}\n\n{}", f.filename, f.content))
            .collect();
        sections.join(SECTION_DELIMITER)
    }
}
