//! Evaluator stub generation.
//!
//! An evaluator is a tiny program exposing one entry point,
//! `<prefix>_evaluate`, that computes the user's expression and returns it
//! as text. The peer loads the compiled stub and calls that entry point.

use std::sync::Arc;

use petri_debug_config::{DebuggerSettings, Language};

use crate::evaluate::Expression;

/// Renders evaluator sources for one target language.
pub trait CodeGenerator: Send + Sync {
    /// Source text of the evaluator for `expression`. `aux` is language
    /// specific (a printf format for C and C++).
    fn render_evaluator(&self, expression: &Expression, aux: Option<&str>) -> Result<String, String>;

    fn source_extension(&self) -> &str;

    fn artifact_extension(&self) -> &str;
}

/// Pick the generator matching the configured language.
pub fn generator_for(settings: &DebuggerSettings) -> Arc<dyn CodeGenerator> {
    match settings.language {
        Language::C | Language::Cpp => Arc::new(CEvaluatorGenerator::new(
            settings.language,
            &settings.prefix,
            &settings.default_format,
        )),
        Language::Lua => Arc::new(LuaEvaluatorGenerator::new(&settings.prefix)),
    }
}

/// C and C++ evaluators.
///
/// The entry point formats the expression into a static buffer with
/// `snprintf`, so the format must match the expression's type.
pub struct CEvaluatorGenerator {
    language: Language,
    prefix: String,
    default_format: String,
}

impl CEvaluatorGenerator {
    pub fn new(language: Language, prefix: &str, default_format: &str) -> Self {
        Self {
            language,
            prefix: prefix.to_string(),
            default_format: default_format.to_string(),
        }
    }

    fn linkage(&self) -> &'static str {
        match self.language {
            Language::Cpp => "extern \"C\" ",
            _ => "",
        }
    }
}

impl CodeGenerator for CEvaluatorGenerator {
    fn render_evaluator(&self, expression: &Expression, aux: Option<&str>) -> Result<String, String> {
        let format = aux.filter(|f| !f.trim().is_empty()).unwrap_or(self.default_format.as_str());
        if !format.contains('%') {
            return Err(format!("'{}' is not a printf format", format));
        }

        let prefix = &self.prefix;
        let linkage = self.linkage();
        let body = expression.render_with(|name| {
            format!("(*{}_variable(petriPtr, {}))", prefix, c_string(name))
        });

        let mut out = String::new();
        out.push_str("// Generated evaluator\n");
        out.push_str("#include <stdint.h>\n#include <stdio.h>\n\n");
        if expression.references_variables() {
            out.push_str(&format!(
                "{}int64_t *{}_variable(void *petriPtr, char const *name);\n\n",
                linkage, prefix
            ));
        }
        out.push_str(&format!("{}char const *{}_evaluate(void *petriPtr) {{\n", linkage, prefix));
        out.push_str("    static char result[4096];\n");
        if !expression.references_variables() {
            out.push_str("    (void)petriPtr;\n");
        }
        out.push_str(&format!(
            "    snprintf(result, sizeof(result), {}, ({}));\n",
            c_string(format),
            body
        ));
        out.push_str("    return result;\n}\n");
        Ok(out)
    }

    fn source_extension(&self) -> &str {
        self.language.source_extension()
    }

    fn artifact_extension(&self) -> &str {
        self.language.artifact_extension()
    }
}

/// Lua evaluators: a chunk defining `<prefix>_evaluate(vars)`.
pub struct LuaEvaluatorGenerator {
    prefix: String,
}

impl LuaEvaluatorGenerator {
    pub fn new(prefix: &str) -> Self {
        Self { prefix: prefix.to_string() }
    }
}

impl CodeGenerator for LuaEvaluatorGenerator {
    fn render_evaluator(&self, expression: &Expression, _aux: Option<&str>) -> Result<String, String> {
        let body = expression.render_with(|name| format!("vars[{}]", c_string(name)));
        Ok(format!(
            "-- Generated evaluator\nfunction {}_evaluate(vars)\n    vars = vars or {{}}\n    return tostring({})\nend\n",
            self.prefix, body
        ))
    }

    fn source_extension(&self) -> &str {
        Language::Lua.source_extension()
    }

    fn artifact_extension(&self) -> &str {
        Language::Lua.artifact_extension()
    }
}

/// Double-quoted literal valid in both C and Lua.
fn c_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
