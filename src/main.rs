fn main() -> anyhow::Result<()> {
    mathgrade_app_lib::run()
}
