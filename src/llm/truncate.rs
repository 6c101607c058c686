//! Message-window truncation
//!
//! Content wrapped with [`wrap_content`] is truncatable; everything outside a
//! wrapper is kept verbatim. [`truncate_wrapped`] shrinks the largest
//! weighted wrapped parts first until the window fits, then removes the
//! markers.

use std::fmt;

use super::client::{LlmError, estimate_tokens};
use super::types::Message;

const OPEN_TAG: &str = "【TRUNCATE";
const OPEN_TAG_END: &str = "】";
const CLOSE_TAG: &str = "【/TRUNCATE】";

/// Smallest cut made in one step, in tokens
const REMOVE_CHUNK: usize = 250;

/// Characters per estimated token
const CHARS_PER_TOKEN: usize = 4;

/// Which end of the content survives truncation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Preserve {
    #[default]
    Top,
    Bottom,
    Both,
}

impl Preserve {
    fn as_str(&self) -> &'static str {
        match self {
            Preserve::Top => "top",
            Preserve::Bottom => "bottom",
            Preserve::Both => "both",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "bottom" => Preserve::Bottom,
            "both" => Preserve::Both,
            _ => Preserve::Top,
        }
    }
}

/// How a wrapped section may shrink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapOptions {
    pub preserve: Preserve,
    /// Weight when picking what to cut; 2 shrinks twice as eagerly as 1
    pub flex: u32,
    /// Never truncate below this many tokens
    pub min_tokens: usize,
}

impl Default for WrapOptions {
    fn default() -> Self {
        Self {
            preserve: Preserve::Top,
            flex: 1,
            min_tokens: 0,
        }
    }
}

impl WrapOptions {
    pub fn preserve(mut self, preserve: Preserve) -> Self {
        self.preserve = preserve;
        self
    }

    pub fn flex(mut self, flex: u32) -> Self {
        self.flex = flex.max(1);
        self
    }

    pub fn min_tokens(mut self, min_tokens: usize) -> Self {
        self.min_tokens = min_tokens;
        self
    }
}

impl fmt::Display for WrapOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "preserve:{} flex:{} min:{}",
            self.preserve.as_str(),
            self.flex,
            self.min_tokens
        )
    }
}

/// Mark `content` as truncatable
pub fn wrap_content(content: &str, options: WrapOptions) -> String {
    format!("{} {} {}{}{}", OPEN_TAG, options, OPEN_TAG_END, content, CLOSE_TAG)
}

/// [`wrap_content`] with default options
pub fn wrap(content: &str) -> String {
    wrap_content(content, WrapOptions::default())
}

/// Remove truncation markers without cutting anything
pub fn strip_markers(content: &str) -> String {
    parse_parts(content).into_iter().map(|p| p.content).collect()
}

#[derive(Debug)]
struct Part {
    content: String,
    tokens: usize,
    truncatable: bool,
    options: WrapOptions,
}

impl Part {
    fn fixed(content: &str) -> Self {
        Self {
            content: content.to_string(),
            tokens: estimate_tokens(content),
            truncatable: false,
            options: WrapOptions::default(),
        }
    }

    fn wrapped(content: &str, options: WrapOptions) -> Self {
        Self {
            content: content.to_string(),
            tokens: estimate_tokens(content),
            truncatable: true,
            options,
        }
    }

    fn weight(&self) -> usize {
        self.tokens * self.options.flex as usize
    }

    fn cut(&mut self, tokens: usize) {
        let chars: Vec<char> = self.content.chars().collect();
        let n = (tokens * CHARS_PER_TOKEN).min(chars.len());
        self.content = match self.options.preserve {
            Preserve::Top => chars[..chars.len() - n].iter().collect(),
            Preserve::Bottom => chars[n..].iter().collect(),
            Preserve::Both => {
                let anchor = chars.len().div_ceil(2);
                let radius = n.div_ceil(2);
                let left = anchor.saturating_sub(radius);
                let right = (anchor + radius).min(chars.len());
                chars[..left].iter().chain(chars[right..].iter()).collect()
            }
        };
        self.tokens = estimate_tokens(&self.content);
    }
}

fn parse_options(attributes: &str) -> WrapOptions {
    let mut options = WrapOptions::default();
    for attribute in attributes.split_whitespace() {
        match attribute.split_once(':') {
            Some(("preserve", v)) => options.preserve = Preserve::parse(v),
            Some(("flex", v)) => options.flex = v.parse::<u32>().unwrap_or(1).max(1),
            Some(("min", v)) => options.min_tokens = v.parse().unwrap_or(0),
            _ => {}
        }
    }
    options
}

fn parse_parts(content: &str) -> Vec<Part> {
    let mut parts = Vec::new();
    let mut rest = content;

    while let Some(open) = rest.find(OPEN_TAG) {
        let after_open = &rest[open + OPEN_TAG.len()..];
        let Some(tag_end) = after_open.find(OPEN_TAG_END) else {
            break;
        };
        let body = &after_open[tag_end + OPEN_TAG_END.len()..];
        let Some(close) = body.find(CLOSE_TAG) else {
            break;
        };

        if open > 0 {
            parts.push(Part::fixed(&rest[..open]));
        }
        parts.push(Part::wrapped(&body[..close], parse_options(&after_open[..tag_end])));
        rest = &body[close + CLOSE_TAG.len()..];
    }

    if !rest.is_empty() {
        parts.push(Part::fixed(rest));
    }
    parts
}

fn total(parts: &[Vec<Part>]) -> usize {
    parts.iter().flatten().map(|p| p.tokens).sum()
}

/// Locate the two heaviest truncatable parts still above their minimum
fn two_biggest(parts: &[Vec<Part>]) -> (Option<(usize, usize)>, usize) {
    let mut biggest: Option<(usize, usize)> = None;
    let mut biggest_weight = 0;
    let mut second_tokens = 0;
    let mut second_weight = 0;

    for (m, message) in parts.iter().enumerate() {
        for (p, part) in message.iter().enumerate() {
            if !part.truncatable || part.tokens <= part.options.min_tokens {
                continue;
            }
            let weight = part.weight();
            if biggest.is_none() || weight > biggest_weight {
                if let Some((bm, bp)) = biggest {
                    second_tokens = parts[bm][bp].tokens;
                    second_weight = biggest_weight;
                }
                biggest = Some((m, p));
                biggest_weight = weight;
            } else if weight > second_weight {
                second_tokens = part.tokens;
                second_weight = weight;
            }
        }
    }
    (biggest, second_tokens)
}

/// Shrink wrapped content until the messages fit in `token_limit` tokens
///
/// Markers are removed from the result. Fails with
/// [`LlmError::ContextOverflow`] when nothing more can be cut.
pub fn truncate_wrapped(messages: &[Message], token_limit: usize) -> Result<Vec<Message>, LlmError> {
    let mut parts: Vec<Vec<Part>> = messages.iter().map(|m| parse_parts(&m.content)).collect();
    let mut current = total(&parts);
    let initial = current;

    while current > token_limit {
        let overflow = || LlmError::ContextOverflow {
            used: current,
            limit: token_limit,
        };
        let (Some((m, p)), second_tokens) = two_biggest(&parts) else {
            return Err(overflow());
        };

        let part = &mut parts[m][p];
        let delta = part.tokens.saturating_sub(second_tokens).max(REMOVE_CHUNK);
        let room = delta.min(part.tokens);
        let mut to_remove = room.min(current - token_limit);
        if part.tokens - to_remove < part.options.min_tokens {
            to_remove = part.tokens - part.options.min_tokens;
        }
        if to_remove == 0 {
            return Err(overflow());
        }

        let before = part.tokens;
        part.cut(to_remove);
        if part.tokens >= before {
            return Err(overflow());
        }
        current = total(&parts);
    }

    if current < initial {
        log::debug!(
            "Truncated message window from {} to {} tokens (limit {})",
            initial,
            current,
            token_limit
        );
    }

    Ok(messages
        .iter()
        .zip(parts)
        .map(|(message, parts)| Message {
            content: parts.into_iter().map(|p| p.content).collect(),
            ..message.clone()
        })
        .collect())
}
