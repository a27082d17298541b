fn main() -> Result<(), Box<dyn std::error::Error>> {
    arena_chat::cli::main()
}
