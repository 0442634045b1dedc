use beryl_parser::Lexer;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const SOURCE: &str = r#"
// representative mix of declarations and expressions
class point ["2d point"] {
    int x;
    int y;
    method point(int px, int py) { x = px; y = py; }
    method int manhattan() { return x + y; }
}

cofunction int gen(int start) { yield start; yield start + 1; }

function int main() {
    point p = new point(0x10, 0b101);
    string banner = "escaped \t text " @"and ""verbatim""";
    float f = 2.5e3;
    int total = 0;
    for (int i = 0; i < 100; i++) { total += p.manhattan() + i % 7; }
    return total;
}
"#;

fn bench_lexer(c: &mut Criterion) {
    c.bench_function("tokenize_mixed_source", |b| {
        b.iter(|| {
            Lexer::new(black_box(SOURCE))
                .tokenize()
                .expect("benchmark source lexes")
        })
    });
}

criterion_group!(benches, bench_lexer);
criterion_main!(benches);
