//! # Script Engine
//!
//! A small expression language used as the daemon's built-in backend:
//!
//! ```text
//! let xs = [1, 2, 3];
//! let m = #{ "a": 1 };
//! while len(xs) < 5 { xs = push(xs, 0); }
//! if m["a"] == 1 { print("one") } else { print("other") }
//! xs
//! ```
//!
//! A program whose tokens end mid-statement is reported as
//! [`Evaluation::Incomplete`] so clients can send it line by line.

mod interp;
mod lexer;
mod parser;

use tracing::debug;

use self::interp::{Interpreter, RuntimeError};
use self::parser::ParseError;
use super::{Engine, EngineError, EngineResult, EngineSession, EvalContext, Evaluation};

pub fn default_prelude() -> Vec<String> {
    vec![
        "let PI = 3.141592653589793;".to_string(),
        "let E = 2.718281828459045;".to_string(),
    ]
}

#[derive(Debug, Clone)]
pub struct ScriptEngine {
    prelude: Vec<String>,
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self::with_prelude(default_prelude())
    }

    pub fn with_prelude(prelude: Vec<String>) -> Self {
        Self { prelude }
    }
}

impl Engine for ScriptEngine {
    fn name(&self) -> &str {
        "script"
    }

    fn prelude(&self) -> Option<String> {
        if self.prelude.is_empty() {
            None
        } else {
            Some(self.prelude.join("\n"))
        }
    }

    fn new_session(&self) -> EngineResult<Box<dyn EngineSession>> {
        Ok(Box::new(ScriptSession::default()))
    }
}

#[derive(Debug, Default)]
pub struct ScriptSession {
    interpreter: Interpreter,
}

impl EngineSession for ScriptSession {
    fn evaluate(&mut self, source: &str, ctx: &EvalContext) -> EngineResult<Evaluation> {
        let tokens = match lexer::tokenize(source) {
            Ok(tokens) => tokens,
            Err(err) => return Ok(Evaluation::Failed(format!("syntax error: {err}"))),
        };
        let program = match parser::parse_program(&tokens) {
            Ok(program) => program,
            Err(ParseError::UnexpectedEof) => return Ok(Evaluation::Incomplete),
            Err(err) => return Ok(Evaluation::Failed(format!("syntax error: {err}"))),
        };

        debug!(statements = program.len(), "running script");
        match self.interpreter.run(&program, ctx) {
            Ok(value) => Ok(Evaluation::Completed(value)),
            Err(RuntimeError::Cancelled) => Err(EngineError::Cancelled),
            Err(RuntimeError::Error(message)) => Ok(Evaluation::Failed(format!("error: {message}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::OutputCapture;
    use crate::value::Value;
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    fn context() -> EvalContext {
        EvalContext::new(OutputCapture::new(4096).begin(), CancellationToken::new())
    }

    fn session() -> Box<dyn EngineSession> {
        ScriptEngine::new().new_session().unwrap()
    }

    #[test]
    fn test_default_prelude_defines_constants() {
        let engine = ScriptEngine::new();
        let mut session = engine.new_session().unwrap();
        let ctx = context();
        let prelude = engine.prelude().unwrap();
        assert_eq!(
            session.evaluate(&prelude, &ctx),
            Ok(Evaluation::Completed(None))
        );
        assert_eq!(
            session.evaluate("PI > 3 && E < 3", &ctx),
            Ok(Evaluation::Completed(Some(Value::Bool(true))))
        );
    }

    #[test]
    fn test_empty_prelude_is_none() {
        assert_eq!(ScriptEngine::with_prelude(vec![]).prelude(), None);
    }

    #[test]
    fn test_outcomes() {
        let mut session = session();
        let ctx = context();
        assert_eq!(session.evaluate("  // nothing", &ctx), Ok(Evaluation::Completed(None)));
        assert_eq!(session.evaluate("if true {", &ctx), Ok(Evaluation::Incomplete));
        assert_eq!(
            session.evaluate("if true {\nprint(1)\n}", &ctx),
            Ok(Evaluation::Completed(None))
        );
        assert_eq!(ctx.output().take(), "1\n");
        assert!(matches!(
            session.evaluate("1 + )", &ctx),
            Ok(Evaluation::Failed(text)) if text.starts_with("syntax error: expected expression")
        ));
        assert!(matches!(
            session.evaluate("\"open", &ctx),
            Ok(Evaluation::Failed(text)) if text.starts_with("syntax error: unterminated string")
        ));
        assert_eq!(
            session.evaluate("missing", &ctx),
            Ok(Evaluation::Failed("error: undefined variable `missing`".to_string()))
        );
    }

    #[test]
    fn test_cancelled_evaluation_is_an_error() {
        let mut session = session();
        let ctx = context();
        ScriptEngine::new().cancel(&ctx);
        assert_eq!(
            session.evaluate("while true {}", &ctx),
            Err(EngineError::Cancelled)
        );
    }
}
