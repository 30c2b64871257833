use eigth::engine::Engine;
use eigth::lexer::ByteSource;

fn main() {
    env_logger::init();

    let stdin = std::io::stdin();
    let input = Box::new(ByteSource::new(stdin.lock()));
    let mut engine = match Engine::new(input) {
        Ok(e) => e,
        Err(e) => eigth::error::die(&e),
    };
    engine.run();
}
