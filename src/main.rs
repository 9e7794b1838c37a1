fn main() {
    article_dashboard_lib::run()
}
