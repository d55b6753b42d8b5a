#![no_main]

use libfuzzer_sys::fuzz_target;
use tracelift::event::coerce_groups;
use tracelift::tokenizer::LineTokenizer;

fuzz_target!(|data: &[u8]| {
    // Lines come from lossy UTF-8 decoding in the pipeline, so do the same here
    let line = String::from_utf8_lossy(data);
    let Ok(tokenizer) = LineTokenizer::new() else {
        return;
    };
    if let Some(tok) = tokenizer.tokenize(&line) {
        let _ = coerce_groups(&tok.groups);
    }
});
