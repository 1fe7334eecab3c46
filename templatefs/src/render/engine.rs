//! The string-expansion engine.
//!
//! Expands a logic-less template by walking `{{…}}` tags and driving the
//! [`RenderHooks`] callbacks. The engine knows nothing about configuration
//! keys; all navigation and value materialization happens behind the hook
//! interface, so the expansion grammar and the backing store can evolve
//! independently.
//!
//! Supported tags:
//!
//! | Tag | Meaning |
//! |---|---|
//! | `{{name}}` / `{{&name}}` | select `name`, emit its value |
//! | `{{.}}` | emit the value of the current item |
//! | `{{*}}` | emit the full key name of the current item |
//! | `{{#name}}…{{/name}}` | enter a section, repeating for each item |
//! | `{{^name}}…{{/name}}` | render only when the section has no items |
//! | `{{!…}}` | comment, dropped |

use super::RenderError;

/// Engine error codes, the reserved negative range distinct from `-errno`.
pub mod code {
    pub const OK: i32 = 0;
    pub const ERROR_SYSTEM: i32 = -1;
    pub const ERROR_UNEXPECTED_END: i32 = -2;
    pub const ERROR_EMPTY_TAG: i32 = -3;
    pub const ERROR_TOO_DEEP: i32 = -6;
    pub const ERROR_CLOSING: i32 = -7;
}

/// Maximum section nesting before the engine refuses with
/// [`code::ERROR_TOO_DEEP`].
const MAX_DEPTH: i32 = 256;

/// The callback contract the engine renders against.
///
/// Boolean results carry the present/absent distinction (`1`/`0` in the
/// original integer convention); `Err` carries system or engine errors
/// that abort the whole render.
pub trait RenderHooks {
    /// Begin a render: push the initial selection.
    fn start(&mut self) -> Result<(), RenderError>;

    /// End a render; `status` is [`code::OK`] or the aborting code.
    fn stop(&mut self, status: i32);

    /// Select a key by name on the current section. `None` selects the
    /// current item.
    fn sel(&mut self, name: Option<&str>) -> Result<bool, RenderError>;

    /// Select a field of the currently selected object. Reserved.
    fn subsel(&mut self, name: &str) -> Result<bool, RenderError>;

    /// Enter the selected section, activating its first item. The engine's
    /// nesting depth is passed through as the object-iterator tag.
    fn enter(&mut self, depth: i32) -> Result<bool, RenderError>;

    /// Activate the next item of the nearest enclosing iteration.
    fn next(&mut self) -> Result<bool, RenderError>;

    /// Leave the last entered section.
    fn leave(&mut self) -> Result<(), RenderError>;

    /// Compare the current value against `value`. Reserved.
    fn compare(&mut self, value: &str) -> i32;

    /// Materialize the current selection's value, or its full key name
    /// when `want_key` is set. `None` means nothing could be produced.
    fn get(&mut self, want_key: bool) -> Result<Option<String>, RenderError>;
}

#[derive(Debug, Clone, PartialEq)]
enum Token<'a> {
    Text(&'a str),
    Var(&'a str),
    Current,
    CurrentKey,
    SectionOpen(&'a str),
    InvertedOpen(&'a str),
    SectionClose(&'a str),
}

fn tokenize(template: &str) -> Result<Vec<Token<'_>>, RenderError> {
    let mut tokens = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            tokens.push(Token::Text(&rest[..open]));
        }
        let after_open = &rest[open + 2..];
        let close = after_open
            .find("}}")
            .ok_or(RenderError::Engine(code::ERROR_UNEXPECTED_END))?;
        let tag = after_open[..close].trim();
        rest = &after_open[close + 2..];

        if tag.is_empty() {
            return Err(RenderError::Engine(code::ERROR_EMPTY_TAG));
        }
        if tag.strip_prefix('!').is_some() {
            // comment
        } else if let Some(name) = tag.strip_prefix('#') {
            tokens.push(Token::SectionOpen(name.trim()));
        } else if let Some(name) = tag.strip_prefix('^') {
            tokens.push(Token::InvertedOpen(name.trim()));
        } else if let Some(name) = tag.strip_prefix('/') {
            tokens.push(Token::SectionClose(name.trim()));
        } else if let Some(name) = tag.strip_prefix('&') {
            tokens.push(Token::Var(name.trim()));
        } else if tag == "." {
            tokens.push(Token::Current);
        } else if tag == "*" {
            tokens.push(Token::CurrentKey);
        } else {
            tokens.push(Token::Var(tag));
        }
    }
    if !rest.is_empty() {
        tokens.push(Token::Text(rest));
    }
    Ok(tokens)
}

/// Index of the close tag matching the open tag at `open`, honoring
/// nesting of inner sections.
fn find_close(tokens: &[Token<'_>], open: usize, name: &str) -> Result<usize, RenderError> {
    let mut nesting = 0usize;
    for (offset, token) in tokens[open + 1..].iter().enumerate() {
        match token {
            Token::SectionOpen(_) | Token::InvertedOpen(_) => nesting += 1,
            Token::SectionClose(close_name) => {
                if nesting == 0 {
                    if *close_name == name {
                        return Ok(open + 1 + offset);
                    }
                    return Err(RenderError::Engine(code::ERROR_CLOSING));
                }
                nesting -= 1;
            }
            _ => {}
        }
    }
    Err(RenderError::Engine(code::ERROR_UNEXPECTED_END))
}

fn emit_value(
    hooks: &mut dyn RenderHooks,
    name: Option<&str>,
    want_key: bool,
    out: &mut String,
) -> Result<(), RenderError> {
    if hooks.sel(name)? {
        if let Some(value) = hooks.get(want_key)? {
            out.push_str(&value);
        }
    }
    Ok(())
}

fn render_range(
    tokens: &[Token<'_>],
    mut pos: usize,
    end: usize,
    depth: i32,
    hooks: &mut dyn RenderHooks,
    out: &mut String,
) -> Result<(), RenderError> {
    while pos < end {
        match &tokens[pos] {
            Token::Text(text) => out.push_str(text),
            Token::Var(name) => emit_value(hooks, Some(*name), false, out)?,
            Token::Current => emit_value(hooks, None, false, out)?,
            Token::CurrentKey => emit_value(hooks, None, true, out)?,
            Token::SectionClose(_) => return Err(RenderError::Engine(code::ERROR_CLOSING)),
            Token::SectionOpen(name) => {
                let close = find_close(tokens, pos, name)?;
                if depth + 1 > MAX_DEPTH {
                    return Err(RenderError::Engine(code::ERROR_TOO_DEEP));
                }
                let entered = hooks.sel(Some(*name))? && hooks.enter(depth + 1)?;
                if entered {
                    loop {
                        render_range(tokens, pos + 1, close, depth + 1, hooks, out)?;
                        if !hooks.next()? {
                            break;
                        }
                    }
                    hooks.leave()?;
                }
                pos = close;
            }
            Token::InvertedOpen(name) => {
                let close = find_close(tokens, pos, name)?;
                let entered = hooks.sel(Some(*name))? && hooks.enter(depth + 1)?;
                if entered {
                    hooks.leave()?;
                } else {
                    render_range(tokens, pos + 1, close, depth + 1, hooks, out)?;
                }
                pos = close;
            }
        }
        pos += 1;
    }
    Ok(())
}

/// Expand `template` against `hooks`, returning the rendered text.
pub fn render(template: &str, hooks: &mut dyn RenderHooks) -> Result<String, RenderError> {
    let tokens = tokenize(template)?;

    hooks.start()?;
    let mut out = String::new();
    let result = render_range(&tokens, 0, tokens.len(), 0, hooks, &mut out);
    let status = match &result {
        Ok(()) => code::OK,
        Err(err) => err.engine_code(),
    };
    hooks.stop(status);

    result.map(|()| out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hooks double that records the call sequence and serves canned
    /// values, for checking the engine's callback discipline.
    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        selection: String,
        items: Vec<&'static str>,
        cursor: usize,
        iterating: bool,
    }

    impl Recorder {
        fn with_items(items: Vec<&'static str>) -> Self {
            Self {
                items,
                ..Self::default()
            }
        }
    }

    impl RenderHooks for Recorder {
        fn start(&mut self) -> Result<(), RenderError> {
            self.calls.push("start".into());
            Ok(())
        }

        fn stop(&mut self, status: i32) {
            self.calls.push(format!("stop({status})"));
        }

        fn sel(&mut self, name: Option<&str>) -> Result<bool, RenderError> {
            self.calls.push(format!("sel({})", name.unwrap_or(".")));
            if let Some(name) = name {
                self.selection = name.to_string();
            }
            Ok(true)
        }

        fn subsel(&mut self, _name: &str) -> Result<bool, RenderError> {
            Ok(false)
        }

        fn enter(&mut self, depth: i32) -> Result<bool, RenderError> {
            self.calls.push(format!("enter({depth})"));
            if self.selection == "items" {
                if self.items.is_empty() {
                    return Ok(false);
                }
                self.iterating = true;
                self.cursor = 0;
            }
            Ok(true)
        }

        fn next(&mut self) -> Result<bool, RenderError> {
            self.calls.push("next".into());
            if self.iterating && self.cursor + 1 < self.items.len() {
                self.cursor += 1;
                Ok(true)
            } else {
                Ok(false)
            }
        }

        fn leave(&mut self) -> Result<(), RenderError> {
            self.calls.push("leave".into());
            self.iterating = false;
            Ok(())
        }

        fn compare(&mut self, _value: &str) -> i32 {
            0
        }

        fn get(&mut self, want_key: bool) -> Result<Option<String>, RenderError> {
            if want_key {
                return Ok(Some(self.selection.clone()));
            }
            if self.iterating {
                return Ok(Some(self.items[self.cursor].to_string()));
            }
            Ok(Some(format!("<{}>", self.selection)))
        }
    }

    #[test]
    fn plain_text_passes_through() {
        let mut hooks = Recorder::default();
        assert_eq!(render("no tags here", &mut hooks).unwrap(), "no tags here");
    }

    #[test]
    fn variable_tags_select_then_get() {
        let mut hooks = Recorder::default();
        let out = render("a {{sys/name}} b", &mut hooks).unwrap();
        assert_eq!(out, "a <sys/name> b");
        assert_eq!(hooks.calls, ["start", "sel(sys/name)", "stop(0)"]);
    }

    #[test]
    fn section_iterates_until_next_is_exhausted() {
        let mut hooks = Recorder::with_items(vec!["a", "b", "c"]);
        let out = render("{{#items}}[{{.}}]{{/items}}", &mut hooks).unwrap();
        assert_eq!(out, "[a][b][c]");
    }

    #[test]
    fn every_enter_is_matched_by_one_leave() {
        let mut hooks = Recorder::with_items(vec!["x", "y"]);
        render("{{#items}}{{.}}{{/items}}{{#other}}{{.}}{{/other}}", &mut hooks).unwrap();
        let enters = hooks.calls.iter().filter(|c| c.starts_with("enter")).count();
        let leaves = hooks.calls.iter().filter(|c| *c == "leave").count();
        assert_eq!(enters, leaves);
        assert_eq!(enters, 2);
    }

    #[test]
    fn empty_section_body_is_skipped() {
        let mut hooks = Recorder::with_items(vec![]);
        let out = render("x{{#items}}[{{.}}]{{/items}}y", &mut hooks).unwrap();
        assert_eq!(out, "xy");
        assert!(!hooks.calls.contains(&"leave".to_string()));
    }

    #[test]
    fn inverted_section_renders_for_empty_iteration() {
        let mut hooks = Recorder::with_items(vec![]);
        let out = render("{{^items}}none{{/items}}", &mut hooks).unwrap();
        assert_eq!(out, "none");

        let mut hooks = Recorder::with_items(vec!["a"]);
        let out = render("{{^items}}none{{/items}}", &mut hooks).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn comments_disappear() {
        let mut hooks = Recorder::default();
        assert_eq!(render("a{{! ignore me }}b", &mut hooks).unwrap(), "ab");
    }

    #[test]
    fn key_name_tag_uses_get_key_mode() {
        let mut hooks = Recorder::default();
        hooks.selection = "preset".into();
        let out = render("{{*}}", &mut hooks).unwrap();
        assert_eq!(out, "preset");
    }

    #[test]
    fn unterminated_tag_is_unexpected_end() {
        let mut hooks = Recorder::default();
        let err = render("a {{oops", &mut hooks).unwrap_err();
        assert_eq!(err.engine_code(), code::ERROR_UNEXPECTED_END);
    }

    #[test]
    fn missing_close_tag_is_unexpected_end() {
        let mut hooks = Recorder::default();
        let err = render("{{#open}}never closed", &mut hooks).unwrap_err();
        assert_eq!(err.engine_code(), code::ERROR_UNEXPECTED_END);
    }

    #[test]
    fn mismatched_close_tag_is_closing_error() {
        let mut hooks = Recorder::default();
        let err = render("{{#a}}{{/b}}", &mut hooks).unwrap_err();
        assert_eq!(err.engine_code(), code::ERROR_CLOSING);
    }

    #[test]
    fn stray_close_tag_is_closing_error() {
        let mut hooks = Recorder::default();
        let err = render("{{/huh}}", &mut hooks).unwrap_err();
        assert_eq!(err.engine_code(), code::ERROR_CLOSING);
    }

    #[test]
    fn empty_tag_is_rejected() {
        let mut hooks = Recorder::default();
        let err = render("{{  }}", &mut hooks).unwrap_err();
        assert_eq!(err.engine_code(), code::ERROR_EMPTY_TAG);
    }

    #[test]
    fn stop_receives_the_aborting_code() {
        let mut hooks = Recorder::default();
        let _ = render("{{#a}}{{/b}}", &mut hooks);
        assert_eq!(
            hooks.calls.last().unwrap(),
            &format!("stop({})", code::ERROR_CLOSING)
        );
    }
}
