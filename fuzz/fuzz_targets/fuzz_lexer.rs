#![no_main]

use libfuzzer_sys::fuzz_target;
use lunar_compiler::lexer::Lexer;
use lunar_compiler::token::Token;

fuzz_target!(|data: &[u8]| {
    // The lexer must never panic on any input — errors are fine, panics are bugs.
    let mut lexer = match Lexer::new(data) {
        Ok(l) => l,
        Err(_) => return,
    };
    while *lexer.current() != Token::Eof {
        if lexer.next().is_err() {
            break;
        }
    }
});
