fn main() {
    // CoreBluetooth leaves the central "unauthorised" for a bare CLI binary.
    // Linking Info.plist into the __TEXT,__info_plist section gives the binary
    // the NSBluetoothAlwaysUsageDescription an app bundle would carry.
    //
    // CARGO_CFG_TARGET_OS is the target, so cross builds pick this up too.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }
    let dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR is set by Cargo");
    let plist = format!("{dir}/Info.plist");

    for arg in ["-sectcreate", "__TEXT", "__info_plist", &plist] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
}
