fn main() {
    let args: Vec<String> = std::env::args().collect();
    let ok = wasmld::link(&args, &mut std::io::stderr());
    if !ok {
        std::process::exit(1);
    }
}
