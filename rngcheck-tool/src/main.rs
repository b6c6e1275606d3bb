use rngcheck_model::Compiler;
use rngcheck_validator::Validator;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::process::exit;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
enum Cli {
    /// Check XML documents against a RELAX NG schema
    Validate {
        /// the schema, in RELAX NG XML syntax
        schema: PathBuf,
        /// the documents to validate
        xml: Vec<PathBuf>,
    },
}

fn main() {
    match Cli::from_args() {
        Cli::Validate { schema, xml } => validate(schema, xml),
    }
}

fn validate(schema: PathBuf, xmls: Vec<PathBuf>) {
    let mut compiler = Compiler::default();
    let compiled = match compiler.compile(&schema) {
        Ok(c) => c,
        Err(err) => {
            compiler.dump_diagnostic(&err);
            exit(1);
        }
    };
    for warning in &compiled.warnings {
        compiler.dump_warning(warning);
    }
    if !compiled.errors.is_empty() {
        for err in &compiled.errors {
            compiler.dump_diagnostic(err);
        }
        exit(1);
    }
    let mut invalid = false;
    for xml in xmls {
        let mut f = match File::open(&xml) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("could not open {:?}: {}", xml, e);
                exit(1);
            }
        };
        let mut doc = String::new();
        if let Err(e) = f.read_to_string(&mut doc) {
            eprintln!("could not read {:?}: {}", xml, e);
            exit(1);
        }
        let reader = xmlparser::Tokenizer::from(&doc[..]);
        let mut v = Validator::new(compiled.start.clone(), reader);
        eprintln!("validating {:?}", xml);
        if let Err(err) = v.run() {
            let (map, d) = v.render_error(xml.to_string_lossy().to_string(), doc.clone(), &err);
            let mut emitter = codemap_diagnostic::Emitter::stderr(
                codemap_diagnostic::ColorConfig::Auto,
                Some(&map),
            );
            emitter.emit(&d[..]);
            exit(2);
        }
        if !v.is_valid() {
            invalid = true;
            let (map, d) = v.render_diagnostics(xml.to_string_lossy().to_string(), doc.clone());
            let mut emitter = codemap_diagnostic::Emitter::stderr(
                codemap_diagnostic::ColorConfig::Auto,
                Some(&map),
            );
            emitter.emit(&d[..]);
            let explanation = v.explain();
            if !explanation.is_empty() {
                eprintln!("expected: {}", explanation);
            }
        }
    }
    if invalid {
        exit(2);
    }
}
