/// Validity notes recorded by containers while they are opened

use std::fmt;

/// Severity of a recorded note
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Informational only
    Info,
    /// Something odd, but the container is usable
    Warning,
    /// Damage was found
    Error,
}

/// A single note
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    /// How serious the note is
    pub severity: Severity,
    /// Human-readable message
    pub message: String,
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Info => "I",
            Severity::Warning => "W",
            Severity::Error => "E",
        };
        write!(f, "{}: {}", tag, self.message)
    }
}

/// Collection of notes plus the "dubious" flag
///
/// A dubious container has damage severe enough that writing to it could make
/// things worse, so it is treated as read-only.
#[derive(Debug, Clone, Default)]
pub struct Notes {
    notes: Vec<Note>,
    dubious: bool,
}

impl Notes {
    /// Create an empty set of notes
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an informational note
    pub fn info<S: Into<String>>(&mut self, message: S) {
        self.push(Severity::Info, message.into());
    }

    /// Add a warning
    pub fn warning<S: Into<String>>(&mut self, message: S) {
        self.push(Severity::Warning, message.into());
    }

    /// Add an error
    pub fn error<S: Into<String>>(&mut self, message: S) {
        self.push(Severity::Error, message.into());
    }

    fn push(&mut self, severity: Severity, message: String) {
        self.notes.push(Note { severity, message });
    }

    /// Flag the container as dubious
    pub fn mark_dubious(&mut self) {
        self.dubious = true;
    }

    /// Is the container dubious?
    pub fn is_dubious(&self) -> bool {
        self.dubious
    }

    /// Number of warnings
    pub fn warning_count(&self) -> usize {
        self.count(Severity::Warning)
    }

    /// Number of errors
    pub fn error_count(&self) -> usize {
        self.count(Severity::Error)
    }

    fn count(&self, severity: Severity) -> usize {
        self.notes.iter().filter(|n| n.severity == severity).count()
    }

    /// Iterate over all notes
    pub fn iter(&self) -> impl Iterator<Item = &Note> {
        self.notes.iter()
    }

    /// Remove all notes and clear the dubious flag
    pub fn clear(&mut self) {
        self.notes.clear();
        self.dubious = false;
    }
}
