fn main() {
    weighlink_lib::run()
}
