fn main() {
    // ── macOS: CoreBluetooth needs an embedded Info.plist ────────────────────
    //
    // A bare CLI binary has no app bundle, so CBCentralManager stays
    // "unauthorised" and never reports the headset. Linking the plist into the
    // __TEXT,__info_plist section gives the binary the usage description that
    // macOS looks for.
    //
    // `CARGO_CFG_TARGET_OS` is the target, not the host.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }

    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        println!("cargo:warning=CARGO_MANIFEST_DIR unset, skipping Info.plist embedding");
        return;
    };
    let plist = format!("{dir}/Info.plist");

    for arg in ["-sectcreate", "__TEXT", "__info_plist", plist.as_str()] {
        println!("cargo:rustc-link-arg={arg}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
}
