use std::path::PathBuf;

use super::CompiledModule;

// Source identities end up as generated class names, so C++ keywords are out.
const RESERVED: &[&str] = &[
    "auto", "bool", "break", "case", "char", "class", "const", "continue", "default", "delete",
    "do", "double", "else", "enum", "extern", "float", "for", "goto", "if", "inline", "int",
    "long", "namespace", "new", "operator", "private", "protected", "public", "return", "short",
    "signed", "sizeof", "static", "struct", "switch", "template", "this", "throw", "try",
    "typedef", "union", "unsigned", "using", "virtual", "void", "volatile", "while",
];

/// The external toolchain that turns source text into a [`CompiledModule`].
///
/// Implementations may take arbitrarily long and are always called off the
/// audio thread. A failure is reported as the toolchain's message, verbatim.
pub trait Compiler: Send + Sync {
    fn compile(
        &self,
        identity: &str,
        source: &str,
        library_paths: &[PathBuf],
    ) -> Result<CompiledModule, String>;

    fn is_valid_identity(&self, identity: &str) -> bool {
        is_identifier(identity)
    }
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };

    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !RESERVED.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers() {
        assert!(is_identifier("Gain"));
        assert!(is_identifier("_lowpass2"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("2pole"));
        assert!(!is_identifier("my-filter"));
        assert!(!is_identifier("class"));
        assert!(!is_identifier("größe"));
    }
}
