// Expression engine
// `${{ }}` expressions inside block attributes: lexing, parsing, evaluation and reference extraction

pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod program;

pub use evaluator::{evaluate_str, EmptyScope, EvalError, Evaluator, Scope};
pub use functions::BuiltinFunctions;
pub use lexer::{extract_expressions, LexError, Lexer, Segment, Token};
pub use parser::{
    collect_references, BinaryOp, Expr, ExprParser, ParseExprError, Reference, ReferencePart,
    UnaryOp,
};
pub use program::{CompileError, Program, Template};
