//! Capability catalog: the allow- and denylists every other stage consults.
//!
//! A [`CapabilityCatalog`] is plain data. It is built once (from defaults or
//! from configuration through [`CatalogBuilder`]), then shared behind an
//! `Arc` by the validator, the runtime and the worker. Nothing mutates it
//! after [`CatalogBuilder::build`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Builtins bound into every snippet's `__builtins__`.
///
/// `print` is listed so snippets may call it, but the runtime always replaces
/// it with the capturing writer. Reflective accessors (`getattr`, `vars`,
/// `globals`) are absent. Library code can still resolve attribute names
/// built at runtime (`string.Formatter.get_field` is one such path), so the
/// static checks are backed by [`DEFAULT_HIDDEN_MEMBERS`] and the runtime
/// audit guard.
pub const DEFAULT_BUILTINS: &[&str] = &[
    // numbers
    "abs", "round", "min", "max", "sum", "pow", "divmod", "bin", "hex", "oct",
    // constructors
    "int", "float", "complex", "str", "bool", "list", "dict", "set", "tuple",
    "frozenset", "bytes", "slice", "object",
    // iteration
    "range", "enumerate", "zip", "map", "filter", "sorted", "reversed", "iter",
    "next", "all", "any", "len",
    // text
    "chr", "ord", "repr", "format", "ascii",
    // types
    "type", "isinstance", "issubclass", "callable", "hasattr", "hash", "id",
    // classes
    "__build_class__", "super", "property", "staticmethod", "classmethod",
    // output
    "print",
    // exceptions
    "BaseException", "Exception", "ArithmeticError", "AssertionError",
    "AttributeError", "IndexError", "KeyError", "LookupError", "NameError",
    "NotImplementedError", "OverflowError", "RuntimeError", "StopIteration",
    "TimeoutError", "TypeError", "ValueError", "ZeroDivisionError",
];

/// Module roots a snippet may import.
pub const DEFAULT_MODULES: &[&str] = &[
    "math",
    "random",
    "datetime",
    "time",
    "json",
    "itertools",
    "functools",
    "collections",
    "re",
    "string",
    "statistics",
    "fractions",
    "decimal",
];

/// `module.member` names withheld from module proxies because they resolve
/// attribute paths from runtime strings.
pub const DEFAULT_HIDDEN_MEMBERS: &[&str] = &["string.Formatter"];

/// Substrings rejected anywhere in a snippet's text, compared case-insensitively.
pub const DEFAULT_DENIED_PATTERNS: &[&str] = &[
    "__import__",
    "eval",
    "exec",
    "compile",
    "open",
    "file",
    "__builtins__",
    "__globals__",
    "__code__",
    "__class__",
    "__bases__",
    "__subclasses__",
    "subprocess",
    "os.system",
    "os.popen",
    "os.spawn",
    "os.exec",
    "shutil",
    "socket",
    "urllib",
    "requests",
    "pickle",
    "marshal",
];

/// Bare-name calls that evaluate, compile or import code dynamically, or
/// otherwise reach outside the namespace.
pub const DEFAULT_DANGEROUS_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "breakpoint",
    "input",
    "open",
];

/// Attributes that hand out frames, code objects, class graphs or module
/// internals. Accessing any of them is a hard violation.
pub const DEFAULT_BLOCKED_ATTRIBUTES: &[&str] = &[
    "__dict__",
    "__mro__",
    "__base__",
    "__bases__",
    "__class__",
    "__subclasses__",
    "__globals__",
    "__builtins__",
    "__code__",
    "__closure__",
    "__func__",
    "__self__",
    "__wrapped__",
    "__loader__",
    "__spec__",
    "__getattribute__",
    "__reduce__",
    "__reduce_ex__",
    "__init_subclass__",
    "__subclasshook__",
    "__traceback__",
    "mro",
    "f_globals",
    "f_locals",
    "f_builtins",
    "f_back",
    "f_code",
    "tb_frame",
    "tb_next",
    "gi_frame",
    "gi_code",
    "cr_frame",
    "cr_code",
    "ag_frame",
    "ag_code",
    "co_code",
    // string.Formatter walks "a.b[c]" field paths with getattr
    "Formatter",
    "get_field",
    "format_field",
    "convert_field",
    "vformat",
];

/// Dunder attributes ordinary object protocols need.
pub const DEFAULT_BENIGN_DUNDERS: &[&str] = &[
    "__init__",
    "__str__",
    "__repr__",
    "__len__",
    "__iter__",
    "__next__",
    "__name__",
    "__doc__",
    "__eq__",
    "__hash__",
];

/// Immutable capability policy for validation and execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityCatalog {
    builtins: BTreeSet<String>,
    modules: BTreeSet<String>,
    hidden_members: BTreeSet<String>,
    denied_patterns: Vec<String>,
    dangerous_calls: BTreeSet<String>,
    blocked_attributes: BTreeSet<String>,
    benign_dunders: BTreeSet<String>,
}

impl Default for CapabilityCatalog {
    fn default() -> Self {
        CatalogBuilder::default().build()
    }
}

impl CapabilityCatalog {
    /// Start from the default policy.
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Permitted builtin names.
    pub fn builtins(&self) -> impl Iterator<Item = &str> {
        self.builtins.iter().map(String::as_str)
    }

    /// Permitted module roots, sorted.
    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(String::as_str)
    }

    /// Denylisted substrings in declaration order.
    pub fn denied_patterns(&self) -> &[String] {
        &self.denied_patterns
    }

    /// Whether `module` (a dotted path) has a permitted root.
    pub fn permits_module(&self, module: &str) -> bool {
        let root = module.split('.').next().unwrap_or(module);
        self.modules.contains(root)
    }

    /// Whether `name` is a permitted builtin.
    pub fn permits_builtin(&self, name: &str) -> bool {
        self.builtins.contains(name)
    }

    /// Whether a bare-name call to `name` is a dynamic evaluation primitive.
    pub fn is_dangerous_call(&self, name: &str) -> bool {
        self.dangerous_calls.contains(name)
    }

    /// Whether reading attribute `attr` is a hard violation.
    pub fn is_blocked_attribute(&self, attr: &str) -> bool {
        self.blocked_attributes.contains(attr)
    }

    /// Whether dunder `attr` is on the benign allowlist.
    pub fn is_benign_dunder(&self, attr: &str) -> bool {
        self.benign_dunders.contains(attr)
    }

    /// Whether `module.member` is withheld from the module's proxy.
    pub fn is_hidden_member(&self, module: &str, member: &str) -> bool {
        self.hidden_members.contains(&format!("{module}.{member}"))
    }

    /// First denylisted pattern occurring in `code`, ignoring case.
    pub fn first_denied_pattern(&self, code: &str) -> Option<&str> {
        let lowered = code.to_lowercase();
        self.denied_patterns
            .iter()
            .find(|p| lowered.contains(&p.to_lowercase()))
            .map(String::as_str)
    }
}

/// Builder for a customised [`CapabilityCatalog`].
#[derive(Debug, Clone)]
pub struct CatalogBuilder {
    catalog: CapabilityCatalog,
}

impl Default for CatalogBuilder {
    fn default() -> Self {
        fn set(items: &[&str]) -> BTreeSet<String> {
            items.iter().map(|s| s.to_string()).collect()
        }
        Self {
            catalog: CapabilityCatalog {
                builtins: set(DEFAULT_BUILTINS),
                modules: set(DEFAULT_MODULES),
                hidden_members: set(DEFAULT_HIDDEN_MEMBERS),
                denied_patterns: DEFAULT_DENIED_PATTERNS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                dangerous_calls: set(DEFAULT_DANGEROUS_CALLS),
                blocked_attributes: set(DEFAULT_BLOCKED_ATTRIBUTES),
                benign_dunders: set(DEFAULT_BENIGN_DUNDERS),
            },
        }
    }
}

impl CatalogBuilder {
    /// Permit another module root.
    pub fn allow_module(mut self, module: impl Into<String>) -> Self {
        self.catalog.modules.insert(module.into());
        self
    }

    /// Withdraw a module root.
    pub fn remove_module(mut self, module: &str) -> Self {
        self.catalog.modules.remove(module);
        self
    }

    /// Permit another builtin.
    ///
    /// Names that are also dangerous calls are ignored; they would be
    /// rejected by the validator anyway.
    pub fn allow_builtin(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.catalog.dangerous_calls.contains(&name) {
            self.catalog.builtins.insert(name);
        }
        self
    }

    /// Withdraw a builtin.
    pub fn remove_builtin(mut self, name: &str) -> Self {
        self.catalog.builtins.remove(name);
        self
    }

    /// Withhold `module.member` from the module's proxy.
    pub fn hide_member(mut self, qualified: impl Into<String>) -> Self {
        self.catalog.hidden_members.insert(qualified.into());
        self
    }

    /// Add a denylisted substring.
    pub fn deny_pattern(mut self, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        if !self.catalog.denied_patterns.contains(&pattern) {
            self.catalog.denied_patterns.push(pattern);
        }
        self
    }

    /// Freeze the policy.
    pub fn build(self) -> CapabilityCatalog {
        self.catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_permits_listed_modules() {
        let catalog = CapabilityCatalog::default();
        assert!(catalog.permits_module("math"));
        assert!(catalog.permits_module("collections.abc"));
        assert!(!catalog.permits_module("os"));
        assert!(!catalog.permits_module("mathx"));
    }

    #[test]
    fn default_catalog_omits_reflective_builtins() {
        let catalog = CapabilityCatalog::default();
        for name in ["getattr", "vars", "globals", "eval", "open"] {
            assert!(!catalog.permits_builtin(name), "{name} must not be a builtin");
        }
        assert!(catalog.permits_builtin("len"));
        assert!(catalog.permits_builtin("__build_class__"));
    }

    #[test]
    fn denied_pattern_matching_ignores_case() {
        let catalog = CapabilityCatalog::default();
        assert_eq!(catalog.first_denied_pattern("x = EVAL"), Some("eval"));
        assert_eq!(catalog.first_denied_pattern("import Socket"), Some("socket"));
        assert_eq!(catalog.first_denied_pattern("1 + 1"), None);
    }

    #[test]
    fn first_denied_pattern_follows_declaration_order() {
        let catalog = CapabilityCatalog::default();
        // "__import__" is declared before "eval".
        assert_eq!(
            catalog.first_denied_pattern("__import__('x'); eval('1')"),
            Some("__import__")
        );
    }

    #[test]
    fn builder_adjusts_modules() {
        let catalog = CapabilityCatalog::builder()
            .allow_module("heapq")
            .remove_module("random")
            .build();
        assert!(catalog.permits_module("heapq"));
        assert!(!catalog.permits_module("random"));
        assert!(catalog.permits_module("math"));
    }

    #[test]
    fn builder_refuses_dangerous_builtins() {
        let catalog = CapabilityCatalog::builder()
            .allow_builtin("eval")
            .allow_builtin("bytearray")
            .build();
        assert!(!catalog.permits_builtin("eval"));
        assert!(catalog.permits_builtin("bytearray"));
    }

    #[test]
    fn builder_does_not_duplicate_patterns() {
        let before = CapabilityCatalog::default().denied_patterns().len();
        let catalog = CapabilityCatalog::builder()
            .deny_pattern("socket")
            .deny_pattern("ctypes")
            .build();
        assert_eq!(catalog.denied_patterns().len(), before + 1);
    }

    #[test]
    fn formatter_is_hidden_and_its_lookups_blocked() {
        let catalog = CapabilityCatalog::default();
        assert!(catalog.is_hidden_member("string", "Formatter"));
        assert!(!catalog.is_hidden_member("string", "Template"));
        assert!(catalog.is_blocked_attribute("get_field"));
        assert!(catalog.is_blocked_attribute("Formatter"));

        let catalog = CapabilityCatalog::builder().hide_member("json.JSONDecoder").build();
        assert!(catalog.is_hidden_member("json", "JSONDecoder"));
    }

    #[test]
    fn catalog_round_trips_through_json() {
        let catalog = CapabilityCatalog::builder().allow_module("heapq").build();
        let json = serde_json::to_string(&catalog).unwrap();
        let back: CapabilityCatalog = serde_json::from_str(&json).unwrap();
        assert_eq!(back, catalog);
    }
}
