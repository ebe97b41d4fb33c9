use std::fmt::{self, Write};
use tracing::field::{Field, Visit};

/// Flattens recorded fields into `message key=value ...`.
#[derive(Default)]
pub(crate) struct FieldText {
    message: String,
    fields: String,
}

impl FieldText {
    pub fn is_empty(&self) -> bool {
        self.message.is_empty() && self.fields.is_empty()
    }

    pub fn text(&self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message.clone(),
            (true, false) => self.fields.clone(),
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }

    fn field(&mut self) -> &mut String {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        &mut self.fields
    }
}

impl Visit for FieldText {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.field(), "{}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.field(), "{}={:?}", field.name(), value);
        }
    }
}
