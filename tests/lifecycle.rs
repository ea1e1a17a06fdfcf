use std::path::Path;

use sigpatch::command::dispatch;
use sigpatch::module::{ModulePaths, Platform};
use sigpatch::{PatchError, Patcher, PatcherConfig, ScanResolver};

const CONFIG: &str = r#"{
    "Patches": {
        "BotNavIgnore": {
            "module": "server",
            "windows": { "signature": "0F 84 ? ? ? ? 48 8B 0D", "patch": "90 E9" },
            "linux": { "signature": "0F 84 ? ? ? ? 48 8B 0D", "patch": "90 E9" }
        },
        "TierZeroReturn": {
            "module": "tier0",
            "windows": { "signature": "40 53 48 83 EC 20", "patch": "C3" },
            "linux": { "signature": "55 48 89 E5 53", "patch": "C3" }
        },
        "StaleSignature": {
            "windows": { "signature": "DE AD BE EF", "patch": "90" },
            "linux": { "signature": "DE AD BE EF", "patch": "90" }
        }
    },
    "EnabledPatches": ["BotNavIgnore", "StaleSignature", "NotConfigured"],
    "RestoreWhenUnload": true
}"#;

const SERVER: [u8; 16] = [
    0xCC, 0xCC, 0x0F, 0x84, 0x10, 0x02, 0x00, 0x00, 0x48, 0x8B, 0x0D, 0x00, 0x00, 0x00, 0x00, 0xC3,
];

fn snapshot(bytes: &[u8]) -> Vec<u8> {
    unsafe { sigpatch::memory::read_bytes(bytes.as_ptr() as usize, bytes.len()).unwrap() }
}

#[test]
fn config_file_to_unload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("patcher.json");
    std::fs::write(&path, CONFIG).unwrap();
    let config = PatcherConfig::load(&path).unwrap();

    let platform = Platform::current();
    let paths = ModulePaths::new("game", "root", platform);
    let server_path = paths.resolve("server");
    assert_eq!(server_path.parent(), Some(Path::new("game")));

    let tier0 = if platform == Platform::Windows {
        vec![0x40u8, 0x53, 0x48, 0x83, 0xEC, 0x20, 0x90, 0x90]
    } else {
        vec![0x55u8, 0x48, 0x89, 0xE5, 0x53, 0x90, 0x90, 0x90]
    };
    let mut tier0 = tier0.into_boxed_slice();
    let mut server = Box::new(SERVER);
    let server_base = server.as_mut_ptr() as usize;
    let tier0_base = tier0.as_mut_ptr() as usize;

    let mut resolver = ScanResolver::new();
    unsafe {
        resolver
            .register(server_path, server_base, server.len())
            .register(paths.resolve("tier0"), tier0_base, tier0.len());
    }
    let patcher = Patcher::new(config, resolver).with_module_paths(paths);

    // load applies what it can and reports the rest
    let outcomes = patcher.start(false);
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].1.as_ref().unwrap(), &(server_base + 2));
    assert!(matches!(outcomes[1].1, Err(PatchError::SignatureNotFound { .. })));
    assert!(matches!(outcomes[2].1, Err(PatchError::UnknownPatchName(_))));
    assert_eq!(&snapshot(&server[..])[2..4], &[0x90, 0xE9]);

    let status = dispatch(&patcher, "status");
    assert_eq!(
        status,
        vec![
            format!("BotNavIgnore: applied at {:#x}", server_base + 2),
            "StaleSignature: not applied".to_string(),
            "TierZeroReturn: not applied".to_string(),
        ]
    );

    let response = dispatch(&patcher, "patch TierZeroReturn");
    assert_eq!(
        response,
        vec![format!(
            "Patch 'TierZeroReturn' successfully patched at {:#x}.",
            tier0_base
        )]
    );
    assert_eq!(snapshot(&tier0[..])[0], 0xC3);

    let response = dispatch(&patcher, "patch TierZeroReturn");
    assert_eq!(response, vec!["Patch 'TierZeroReturn' is already applied"]);

    let response = dispatch(&patcher, "restore TierZeroReturn");
    assert_eq!(response, vec!["Patch 'TierZeroReturn' successfully restored."]);
    assert_ne!(snapshot(&tier0[..])[0], 0xC3);

    let response = dispatch(&patcher, "restore TierZeroReturn");
    assert_eq!(response, vec!["Patch 'TierZeroReturn' is not applied"]);

    let response = dispatch(&patcher, "frobnicate");
    assert_eq!(response[0], "Unknown command");

    // hot reload keeps patches, real unload restores them
    assert!(patcher.stop(true).is_empty());
    assert!(patcher.is_applied("BotNavIgnore"));
    let outcomes = patcher.stop(false);
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].1.is_ok());
    assert_eq!(snapshot(&server[..]), SERVER.to_vec());
    assert!(dispatch(&patcher, "status")[0].ends_with("not applied"));
}
