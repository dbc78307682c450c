fn main() {
    hive::main();
}
