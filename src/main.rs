fn main() -> anyhow::Result<()> {
    chatdb_lib::run()
}
