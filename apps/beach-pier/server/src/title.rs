//! Window title templates such as `TTY - {{ .Command }}`.
//!
//! Only field substitution is supported. Templates are parsed once at
//! startup; rendering happens once per session during the handshake.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated action starting at byte {0}")]
    Unterminated(usize),
    #[error("unsupported action {{{{ {0} }}}}")]
    UnsupportedAction(String),
    #[error("unknown field .{0}")]
    UnknownField(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Field(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleTemplate {
    source: String,
    segments: Vec<Segment>,
}

/// Values available to the title template.
#[derive(Debug, Clone, Default)]
pub struct TitleContext {
    /// Command running in the remote session.
    pub command: String,
    /// Human readable target, e.g. `default/web-0/nginx`.
    pub target: String,
}

impl TitleContext {
    fn lookup(&self, field: &str) -> Option<&str> {
        match field {
            "Command" => Some(&self.command),
            "Target" => Some(&self.target),
            _ => None,
        }
    }
}

impl TitleTemplate {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after_open = &rest[start + 2..];
            let end = after_open
                .find("}}")
                .ok_or(TemplateError::Unterminated(offset + start))?;
            let action = after_open[..end].trim();
            segments.push(Segment::Field(parse_field(action)?));

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, context: &TitleContext) -> Result<String, TemplateError> {
        let mut title = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => title.push_str(text),
                Segment::Field(name) => {
                    let value = context
                        .lookup(name)
                        .ok_or_else(|| TemplateError::UnknownField(name.clone()))?;
                    title.push_str(value);
                }
            }
        }
        Ok(title)
    }

    /// Renders against an empty context to surface unknown fields early.
    pub fn check(&self) -> Result<(), TemplateError> {
        self.render(&TitleContext::default()).map(|_| ())
    }
}

fn parse_field(action: &str) -> Result<String, TemplateError> {
    let name = action
        .strip_prefix('.')
        .ok_or_else(|| TemplateError::UnsupportedAction(action.to_string()))?;
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name.to_string())
    } else {
        Err(TemplateError::UnsupportedAction(action.to_string()))
    }
}
