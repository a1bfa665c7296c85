//! Composable message blocks.
//!
//! A [`Block`] produces two renderings per channel: a flat text body and a
//! structured options map (chat: a `blocks` array of structured elements;
//! mail: `subject`, `html_message`, `recipient_list`, ...). Composites render
//! their children in order, join the texts with newlines, and deep-merge the
//! options maps via [`full_merge_dict`].

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::model::Channel;
use crate::template::{TemplateEngine, TemplateError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("cannot merge mismatched types at key '{key}'")]
    TypeMismatch { key: String },
    #[error("no merge strategy for value at key '{key}'")]
    Strategy { key: String },
}

#[derive(Debug, Error)]
pub enum BlockError {
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Inputs a render may need beyond the block itself. Only mail rendering
/// looks at the sender and recipients.
pub struct RenderContext<'a> {
    pub templates: &'a dyn TemplateEngine,
    pub from_email: Option<&'a str>,
    pub recipients: &'a [String],
    pub create_link: bool,
}

impl<'a> RenderContext<'a> {
    pub fn new(templates: &'a dyn TemplateEngine) -> Self {
        Self {
            templates,
            from_email: None,
            recipients: &[],
            create_link: false,
        }
    }
}

/// A reusable content fragment. The closed set of variants is dispatched in
/// [`Block::render`]; `Message` is the ordered composite.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Empty,
    /// Plain text on every channel.
    Basic(String),
    /// Chat "section" element; renders like `Basic` for mail.
    Section(String),
    /// Chat "context" element list; one structured entry per element.
    Context(Vec<String>),
    /// `Basic` plus a subject line.
    BasicSubject { subject: String, message: String },
    /// Renders like `Basic` for chat, but mail body/subject/html come from
    /// the template engine.
    TemplatedMail {
        message: String,
        template: String,
        context: Map<String, Value>,
        create_link: bool,
    },
    /// Adds mail recipients without adding any text.
    ExtraRecipients(Vec<String>),
    /// Ordered composite of other blocks.
    Message(Vec<Block>),
}

impl Block {
    /// Render to `(text, options)` for the given channel.
    pub fn render(
        &self,
        channel: Channel,
        ctx: &RenderContext<'_>,
    ) -> Result<(String, Map<String, Value>), BlockError> {
        match channel {
            Channel::Chat => self.render_chat(ctx),
            Channel::Mail => self.render_mail(ctx),
        }
    }

    fn render_chat(
        &self,
        ctx: &RenderContext<'_>,
    ) -> Result<(String, Map<String, Value>), BlockError> {
        match self {
            Block::Empty | Block::ExtraRecipients(_) => Ok((String::new(), Map::new())),
            Block::Basic(message) | Block::TemplatedMail { message, .. } => {
                Ok((message.clone(), Map::new()))
            }
            Block::Section(message) => {
                let mut options = Map::new();
                options.insert(
                    "blocks".into(),
                    json!([{"type": "section", "text": {"type": "mrkdwn", "text": message}}]),
                );
                Ok((message.clone(), options))
            }
            Block::Context(elements) => {
                let structured: Vec<Value> = elements
                    .iter()
                    .map(|el| json!({"type": "mrkdwn", "text": el}))
                    .collect();
                let mut options = Map::new();
                options.insert(
                    "blocks".into(),
                    json!([{"type": "context", "elements": structured}]),
                );
                Ok((elements.join("\n"), options))
            }
            Block::BasicSubject { subject, message } => {
                Ok((format!("{subject}: {message}"), Map::new()))
            }
            Block::Message(children) => self.render_composite(children, Channel::Chat, ctx),
        }
    }

    fn render_mail(
        &self,
        ctx: &RenderContext<'_>,
    ) -> Result<(String, Map<String, Value>), BlockError> {
        match self {
            Block::Empty => Ok((String::new(), Map::new())),
            Block::Basic(message) | Block::Section(message) => {
                Ok((message.clone(), basic_mail_options(ctx)))
            }
            Block::Context(elements) => Ok((elements.join("\n"), Map::new())),
            Block::BasicSubject { subject, message } => {
                let mut options = basic_mail_options(ctx);
                options.insert("subject".into(), json!(subject));
                Ok((message.clone(), options))
            }
            Block::TemplatedMail {
                template,
                context,
                create_link,
                ..
            } => {
                let mut options = basic_mail_options(ctx);
                let rendered = ctx.templates.render(
                    template,
                    context,
                    ctx.from_email,
                    ctx.recipients,
                    *create_link || ctx.create_link,
                )?;
                options.insert("subject".into(), json!(rendered.subject));
                if let Some(html) = rendered.html {
                    options.insert("html_message".into(), json!(html));
                }
                Ok((rendered.body, options))
            }
            Block::ExtraRecipients(emails) => {
                let mut options = Map::new();
                options.insert("recipient_list".into(), json!(emails));
                Ok((String::new(), options))
            }
            Block::Message(children) => self.render_composite(children, Channel::Mail, ctx),
        }
    }

    fn render_composite(
        &self,
        children: &[Block],
        channel: Channel,
        ctx: &RenderContext<'_>,
    ) -> Result<(String, Map<String, Value>), BlockError> {
        let mut texts = Vec::with_capacity(children.len());
        let mut options = Map::new();
        for child in children {
            let (text, child_options) = child.render(channel, ctx)?;
            texts.push(text);
            full_merge_dict(&mut options, &child_options)?;
        }
        Ok((texts.join("\n"), options))
    }
}

fn basic_mail_options(ctx: &RenderContext<'_>) -> Map<String, Value> {
    let mut options = Map::new();
    if let Some(from) = ctx.from_email {
        options.insert("from_email".into(), json!(from));
    }
    options
}

/// Deterministic deep merge of `src` into `dst`:
/// numbers and strings are overwritten, arrays concatenated, objects merged
/// recursively. Mismatched types fail, as do values with no strategy
/// (booleans, nulls). Keys only present in `src` are copied over.
pub fn full_merge_dict(
    dst: &mut Map<String, Value>,
    src: &Map<String, Value>,
) -> Result<(), MergeError> {
    for (key, dst_val) in dst.iter_mut() {
        let Some(src_val) = src.get(key) else {
            continue;
        };
        match (dst_val, src_val) {
            (Value::Object(d), Value::Object(s)) => full_merge_dict(d, s)?,
            (Value::Array(d), Value::Array(s)) => d.extend(s.iter().cloned()),
            (d @ Value::Number(_), s @ Value::Number(_)) => *d = s.clone(),
            (d @ Value::String(_), s @ Value::String(_)) => *d = s.clone(),
            (Value::Bool(_), Value::Bool(_)) | (Value::Null, Value::Null) => {
                return Err(MergeError::Strategy { key: key.clone() })
            }
            _ => return Err(MergeError::TypeMismatch { key: key.clone() }),
        }
    }
    for (key, value) in src {
        if !dst.contains_key(key) {
            dst.insert(key.clone(), value.clone());
        }
    }
    Ok(())
}
