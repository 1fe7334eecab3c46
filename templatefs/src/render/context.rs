//! Navigation state for a single render: the section stack.
//!
//! Each [`Section`] frame tracks the currently selected configuration key
//! and any in-progress array iteration. Entering a section pushes a copy
//! of the parent frame, so outer iteration state survives nested arrays;
//! child mutations never leak back into the parent.

use super::engine::{code, RenderHooks};
use super::RenderError;
use crate::store::{is_absolute_name, KeyName, KeySet, Value, ROOT_KEY};
use crate::sys::Errno;

/// One frame of the section stack.
#[derive(Debug, Clone)]
pub struct Section {
    /// The currently selected key.
    selection: KeyName,
    /// Set iff this section is iterating an array; the base the elements
    /// hang below.
    array_base: Option<KeyName>,
    /// Cursor into the key set's collation order while iterating.
    cursor: usize,
    is_array: bool,
    /// The object-iterator tag supplied by the expansion engine.
    depth: i32,
}

impl Section {
    fn root(root: &KeyName) -> Self {
        Self {
            selection: root.clone(),
            array_base: None,
            cursor: 0,
            is_array: false,
            depth: -1,
        }
    }

    fn child_of(parent: &Section, depth: i32) -> Self {
        Self {
            selection: parent.selection.clone(),
            array_base: parent.array_base.clone(),
            cursor: parent.cursor,
            is_array: parent.is_array,
            depth,
        }
    }

    pub fn selection(&self) -> &KeyName {
        &self.selection
    }

    pub fn is_array(&self) -> bool {
        self.is_array
    }
}

/// Advance `section`'s array cursor to the next key directly below its
/// array base. Deeper descendants are skipped; the first key outside the
/// base's subtree ends the iteration.
fn select_next_array_key(section: &mut Section, keys: &KeySet) -> Result<bool, RenderError> {
    let base = match &section.array_base {
        Some(base) => base.clone(),
        None => return Ok(false),
    };
    loop {
        section.cursor += 1;
        match keys.at(section.cursor) {
            None => return Ok(false),
            Some(key) if key.name().is_directly_below(&base) => {
                section.selection = key.name().clone();
                return Ok(true);
            }
            Some(key) if key.name().is_below(&base) => continue,
            Some(_) => return Ok(false),
        }
    }
}

/// Per-render navigation context over a pre-populated key set.
#[derive(Debug)]
pub struct RenderContext {
    keys: KeySet,
    root: KeyName,
    stack: Vec<Section>,
}

impl RenderContext {
    pub fn new(keys: KeySet) -> Self {
        Self {
            keys,
            root: KeyName::new(ROOT_KEY),
            stack: Vec::new(),
        }
    }

    /// Current depth of the section stack, non-zero between `start` and
    /// `stop`.
    pub fn section_depth(&self) -> usize {
        self.stack.len()
    }

    fn top(&self) -> Result<&Section, RenderError> {
        self.stack
            .last()
            .ok_or(RenderError::Engine(code::ERROR_TOO_DEEP))
    }

    fn top_mut(&mut self) -> Result<&mut Section, RenderError> {
        self.stack
            .last_mut()
            .ok_or(RenderError::Engine(code::ERROR_TOO_DEEP))
    }

    /// The selection a fresh `sel` derives from: the parent frame's, or
    /// the root key at the outermost level.
    fn parent_selection(&self) -> KeyName {
        if self.stack.len() >= 2 {
            self.stack[self.stack.len() - 2].selection.clone()
        } else {
            self.root.clone()
        }
    }

    /// Re-examine the current selection: when it carries the `array` meta
    /// attribute, begin iterating its direct children.
    fn update_selection(&mut self) -> Result<(), RenderError> {
        let selection = self.top()?.selection.clone();
        let is_array = self
            .keys
            .lookup(&selection)
            .and_then(|key| key.meta("array"))
            .is_some();
        if !is_array {
            return Ok(());
        }

        let cursor = self
            .keys
            .position(&selection)
            .ok_or(RenderError::Sys(Errno(libc::EKEYREJECTED)))?;

        let Self { keys, stack, .. } = self;
        let top = stack
            .last_mut()
            .ok_or(RenderError::Engine(code::ERROR_TOO_DEEP))?;
        top.is_array = true;
        top.array_base = Some(selection);
        top.cursor = cursor;
        select_next_array_key(top, keys)?;
        Ok(())
    }
}

impl RenderHooks for RenderContext {
    fn start(&mut self) -> Result<(), RenderError> {
        self.stack.clear();
        self.stack.push(Section::root(&self.root));
        Ok(())
    }

    fn stop(&mut self, _status: i32) {
        self.stack.pop();
    }

    fn sel(&mut self, name: Option<&str>) -> Result<bool, RenderError> {
        let parent = self.parent_selection();
        {
            let top = self.top_mut()?;
            top.is_array = false;
            top.array_base = None;
            match name {
                // The current item: refresh from the parent so an
                // in-progress iteration is observed.
                None => top.selection = parent,
                // Absolute or namespaced: replace the selection outright.
                Some(name) if is_absolute_name(name) => {
                    top.selection = KeyName::new(name);
                }
                // Append mode: refresh from the parent first, so appends
                // land beneath the array index rather than a stale sibling.
                Some(name) => {
                    top.selection = parent;
                    for segment in name.split('/').filter(|s| !s.is_empty()) {
                        top.selection.push(segment);
                    }
                }
            }
        }
        self.update_selection()?;
        Ok(true)
    }

    fn subsel(&mut self, _name: &str) -> Result<bool, RenderError> {
        Ok(false)
    }

    fn enter(&mut self, depth: i32) -> Result<bool, RenderError> {
        let top = self.top()?;
        // An array whose cursor never reached a first element has nothing
        // to activate.
        if top.is_array && top.array_base.as_ref() == Some(&top.selection) {
            return Ok(false);
        }
        let child = Section::child_of(top, depth);
        self.stack.push(child);
        Ok(true)
    }

    fn next(&mut self) -> Result<bool, RenderError> {
        if self.stack.is_empty() {
            return Err(RenderError::Engine(code::ERROR_TOO_DEEP));
        }
        // Advance the nearest enclosing array section; the top frame is
        // the body's scratch copy, never the iteration owner.
        let Self { keys, stack, .. } = self;
        let len = stack.len();
        for frame in stack[..len - 1].iter_mut().rev() {
            if frame.is_array {
                return select_next_array_key(frame, keys);
            }
        }
        Ok(false)
    }

    fn leave(&mut self) -> Result<(), RenderError> {
        if self.stack.len() <= 1 {
            return Err(RenderError::Engine(code::ERROR_TOO_DEEP));
        }
        self.stack.pop();
        Ok(())
    }

    fn compare(&mut self, _value: &str) -> i32 {
        0
    }

    fn get(&mut self, want_key: bool) -> Result<Option<String>, RenderError> {
        let selection = self.top()?.selection.clone();
        if want_key {
            return Ok(Some(selection.as_str().to_string()));
        }
        match self.keys.lookup(&selection) {
            None => Ok(None),
            Some(key) => match key.value() {
                Value::Text(text) => Ok(Some(text.clone())),
                Value::Binary(raw) if raw.len() == 2 => {
                    let value = i16::from_ne_bytes([raw[0], raw[1]]);
                    Ok(Some(value.to_string()))
                }
                Value::Binary(raw) if raw.len() == 8 => {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(raw);
                    Ok(Some(i64::from_ne_bytes(bytes).to_string()))
                }
                Value::Binary(_) => Err(RenderError::Sys(Errno(libc::EINVAL))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::engine::render;
    use super::*;
    use crate::store::Key;

    fn name(s: &str) -> KeyName {
        KeyName::new(s)
    }

    fn key(s: &str, v: &str) -> Key {
        Key::text(name(s), v)
    }

    fn array_fixture() -> KeySet {
        [
            key("system:/config/items", "").with_meta("array", "#2"),
            key("system:/config/items/#0", "a"),
            key("system:/config/items/#1", "b"),
            key("system:/config/items/#2", "c"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn variable_resolves_below_the_root_key() {
        let keys: KeySet = [key("system:/config/sys/name", "world")].into_iter().collect();
        let mut ctx = RenderContext::new(keys);
        let out = render("hi {{sys/name}}!", &mut ctx).unwrap();
        assert_eq!(out, "hi world!");
    }

    #[test]
    fn missing_variable_expands_to_nothing() {
        let mut ctx = RenderContext::new(KeySet::new());
        assert_eq!(render("[{{missing}}]", &mut ctx).unwrap(), "[]");
    }

    #[test]
    fn array_iteration_visits_direct_children_in_order() {
        let mut ctx = RenderContext::new(array_fixture());
        let out = render("{{#items}}[{{.}}]{{/items}}", &mut ctx).unwrap();
        assert_eq!(out, "[a][b][c]");
    }

    #[test]
    fn deeper_descendants_are_not_array_elements() {
        let mut keys = array_fixture();
        keys.insert(key("system:/config/items/#1/detail", "x"));
        let mut ctx = RenderContext::new(keys);
        let out = render("{{#items}}[{{.}}]{{/items}}", &mut ctx).unwrap();
        assert_eq!(out, "[a][b][c]");
    }

    #[test]
    fn sel_inside_iteration_appends_below_the_array_index() {
        let keys: KeySet = [
            key("system:/config/hosts", "").with_meta("array", "#1"),
            key("system:/config/hosts/#0", ""),
            key("system:/config/hosts/#0/name", "alpha"),
            key("system:/config/hosts/#1", ""),
            key("system:/config/hosts/#1/name", "beta"),
        ]
        .into_iter()
        .collect();
        let mut ctx = RenderContext::new(keys);
        let out = render("{{#hosts}}<{{name}}>{{/hosts}}", &mut ctx).unwrap();
        assert_eq!(out, "<alpha><beta>");
    }

    #[test]
    fn nested_arrays_preserve_outer_iteration_state() {
        let keys: KeySet = [
            key("system:/config/outer", "").with_meta("array", "#1"),
            key("system:/config/outer/#0", ""),
            key("system:/config/outer/#0/tags", "").with_meta("array", "#1"),
            key("system:/config/outer/#0/tags/#0", "p"),
            key("system:/config/outer/#0/tags/#1", "q"),
            key("system:/config/outer/#1", ""),
            key("system:/config/outer/#1/tags", "").with_meta("array", "#0"),
            key("system:/config/outer/#1/tags/#0", "r"),
        ]
        .into_iter()
        .collect();
        let mut ctx = RenderContext::new(keys);
        let out = render("{{#outer}}({{#tags}}{{.}}{{/tags}}){{/outer}}", &mut ctx).unwrap();
        assert_eq!(out, "(pq)(r)");
    }

    #[test]
    fn empty_array_renders_nothing() {
        let keys: KeySet = [key("system:/config/items", "").with_meta("array", "")]
            .into_iter()
            .collect();
        let mut ctx = RenderContext::new(keys);
        let out = render("x{{#items}}[{{.}}]{{/items}}y", &mut ctx).unwrap();
        assert_eq!(out, "xy");
    }

    #[test]
    fn inverted_section_renders_only_for_empty_arrays() {
        let empty: KeySet = [key("system:/config/items", "").with_meta("array", "")]
            .into_iter()
            .collect();
        let mut ctx = RenderContext::new(empty);
        assert_eq!(
            render("{{^items}}none{{/items}}", &mut ctx).unwrap(),
            "none"
        );

        let mut ctx = RenderContext::new(array_fixture());
        assert_eq!(render("{{^items}}none{{/items}}", &mut ctx).unwrap(), "");
    }

    #[test]
    fn key_name_tag_emits_the_full_key_name() {
        let mut ctx = RenderContext::new(array_fixture());
        let out = render("{{#items}}{{*}};{{/items}}", &mut ctx).unwrap();
        assert_eq!(
            out,
            "system:/config/items/#0;system:/config/items/#1;system:/config/items/#2;"
        );
    }

    #[test]
    fn absolute_names_replace_the_selection() {
        let keys: KeySet = [
            key("system:/config/sys/name", "inner"),
            key("system:/other/name", "outer"),
        ]
        .into_iter()
        .collect();
        let mut ctx = RenderContext::new(keys);
        let out = render("{{system:/other/name}}", &mut ctx).unwrap();
        assert_eq!(out, "outer");
    }

    #[test]
    fn binary_values_format_as_decimal_by_width() {
        let mut keys = KeySet::new();
        keys.insert(Key::binary(
            name("system:/config/port"),
            1234i16.to_ne_bytes().to_vec(),
        ));
        keys.insert(Key::binary(
            name("system:/config/size"),
            987654321i64.to_ne_bytes().to_vec(),
        ));
        let mut ctx = RenderContext::new(keys);
        let out = render("{{port}}/{{size}}", &mut ctx).unwrap();
        assert_eq!(out, "1234/987654321");
    }

    #[test]
    fn odd_binary_widths_are_rejected() {
        let mut keys = KeySet::new();
        keys.insert(Key::binary(name("system:/config/blob"), vec![1, 2, 3]));
        let mut ctx = RenderContext::new(keys);
        let err = render("{{blob}}", &mut ctx).unwrap_err();
        match err {
            RenderError::Sys(errno) => assert_eq!(errno, Errno(libc::EINVAL)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn section_stack_is_torn_down_after_render() {
        let mut ctx = RenderContext::new(array_fixture());
        render("{{#items}}{{.}}{{/items}}", &mut ctx).unwrap();
        assert_eq!(ctx.section_depth(), 0);
    }

    #[test]
    fn section_stack_is_torn_down_after_failure() {
        let mut ctx = RenderContext::new(KeySet::new());
        let _ = render("{{#a}}{{/b}}", &mut ctx);
        assert_eq!(ctx.section_depth(), 0);
    }

    #[test]
    fn next_advances_the_nearest_enclosing_array() {
        let mut ctx = RenderContext::new(array_fixture());
        ctx.start().unwrap();
        assert!(ctx.sel(Some("items")).unwrap());
        assert!(ctx.enter(0).unwrap());

        // The body's scratch frame selects the current element each time.
        ctx.sel(None).unwrap();
        assert_eq!(ctx.get(false).unwrap().as_deref(), Some("a"));

        assert!(ctx.next().unwrap());
        ctx.sel(None).unwrap();
        assert_eq!(ctx.get(false).unwrap().as_deref(), Some("b"));

        assert!(ctx.next().unwrap());
        assert!(!ctx.next().unwrap());

        ctx.leave().unwrap();
        ctx.stop(0);
        assert_eq!(ctx.section_depth(), 0);
    }

    #[test]
    fn leave_on_the_start_frame_is_a_programming_error() {
        let mut ctx = RenderContext::new(KeySet::new());
        ctx.start().unwrap();
        let err = ctx.leave().unwrap_err();
        assert_eq!(err.engine_code(), code::ERROR_TOO_DEEP);
    }
}
