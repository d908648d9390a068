//! Synthetic project fixtures for tests.
//!
//! Builds a small but structurally faithful pods-style checkout on disk so
//! reader, fingerprint and stage tests can run without Xcode.

use std::fs;
use std::path::{Path, PathBuf};

/// A fixture `project.pbxproj` with one cacheable framework target
/// (`Alamofire`, two Swift sources, a folder resource, per-file settings and
/// an xcconfig-backed Debug configuration), one excluded `Pods-App` target
/// and one sub-project reference.
pub const FIXTURE_PBXPROJ: &str = r#"// !$*UTF8*$!
{
	archiveVersion = 1;
	classes = {};
	objectVersion = 56;
	objects = {
		MA1N6R0000000000000000AA = {isa = PBXGroup; children = (6R0A1AM000000000000000AA, 5UBREF0000000000000000AA, XCCREF0000000000000000AA); sourceTree = "<group>"; };
		6R0A1AM000000000000000AA = {isa = PBXGroup; children = (6R05RC0000000000000000AA); path = Alamofire; sourceTree = "<group>"; };
		6R05RC0000000000000000AA = {isa = PBXGroup; children = (FRAF000000000000000000AA, FRHTTP0000000000000000AA, FRRES00000000000000000AA); path = Source; sourceTree = "<group>"; };
		FRAF000000000000000000AA = {isa = PBXFileReference; lastKnownFileType = sourcecode.swift; path = AF.swift; sourceTree = "<group>"; };
		FRHTTP0000000000000000AA = {isa = PBXFileReference; lastKnownFileType = sourcecode.swift; path = HTTP.swift; sourceTree = "<group>"; };
		FRRES00000000000000000AA = {isa = PBXFileReference; lastKnownFileType = folder; path = Resources; sourceTree = "<group>"; };
		5UBREF0000000000000000AA = {isa = PBXFileReference; lastKnownFileType = "wrapper.pb-project"; name = Local.xcodeproj; path = "Local/Local.xcodeproj"; sourceTree = SOURCE_ROOT; };
		XCCREF0000000000000000AA = {isa = PBXFileReference; lastKnownFileType = text.xcconfig; path = Alamofire.debug.xcconfig; sourceTree = "<group>"; };
		BFAF000000000000000000AA = {isa = PBXBuildFile; fileRef = FRAF000000000000000000AA; settings = {COMPILER_FLAGS = "-fno-objc-arc"; }; };
		BFHTTP0000000000000000AA = {isa = PBXBuildFile; fileRef = FRHTTP0000000000000000AA; };
		BFRES00000000000000000AA = {isa = PBXBuildFile; fileRef = FRRES00000000000000000AA; };
		PH5RC00000000000000000AA = {isa = PBXSourcesBuildPhase; buildActionMask = 2147483647; files = (BFAF000000000000000000AA, BFHTTP0000000000000000AA); runOnlyForDeploymentPostprocessing = 0; };
		PHHDR00000000000000000AA = {isa = PBXHeadersBuildPhase; buildActionMask = 2147483647; files = (); runOnlyForDeploymentPostprocessing = 0; };
		PHRES00000000000000000AA = {isa = PBXResourcesBuildPhase; buildActionMask = 2147483647; files = (BFRES00000000000000000AA); runOnlyForDeploymentPostprocessing = 0; };
		T6TA1AM000000000000000AA = {isa = PBXNativeTarget; buildConfigurationList = C1A1AM0000000000000000AA; buildPhases = (PH5RC00000000000000000AA, PHHDR00000000000000000AA, PHRES00000000000000000AA); name = Alamofire; productName = Alamofire; productType = "com.apple.product-type.framework"; };
		C1A1AM0000000000000000AA = {isa = XCConfigurationList; buildConfigurations = (CF6A1AM000000000000000AA); defaultConfigurationName = Debug; };
		CF6A1AM000000000000000AA = {isa = XCBuildConfiguration; baseConfigurationReference = XCCREF0000000000000000AA; buildSettings = {MODULE_TAG = "mod-$(TARGET_NAME)"; PRODUCT_NAME = "$(TARGET_NAME)"; }; name = Debug; };
		T6TP0D5000000000000000AA = {isa = PBXNativeTarget; buildConfigurationList = C1P0D50000000000000000AA; buildPhases = (); name = "Pods-App"; productName = "Pods-App"; productType = "com.apple.product-type.library.static"; };
		C1P0D50000000000000000AA = {isa = XCConfigurationList; buildConfigurations = (CF6P0D5000000000000000AA); defaultConfigurationName = Debug; };
		CF6P0D5000000000000000AA = {isa = XCBuildConfiguration; buildSettings = {}; name = Debug; };
		PR0J000000000000000000AA = {isa = PBXProject; buildConfigurationList = C1PR0J0000000000000000AA; mainGroup = MA1N6R0000000000000000AA; targets = (T6TA1AM000000000000000AA, T6TP0D5000000000000000AA); };
		C1PR0J0000000000000000AA = {isa = XCConfigurationList; buildConfigurations = (CF6PR0J000000000000000AA); defaultConfigurationName = Debug; };
		CF6PR0J000000000000000AA = {isa = XCBuildConfiguration; buildSettings = {GCC_OPTIMIZATION_LEVEL = 0; }; name = Debug; };
	};
	rootObject = PR0J000000000000000000AA;
}
"#;

/// An empty referenced sub-project, to exercise transitive opening.
pub const LOCAL_PBXPROJ: &str = r#"// !$*UTF8*$!
{
	archiveVersion = 1;
	classes = {};
	objectVersion = 56;
	objects = {
		10CA16R000000000000000AA = {isa = PBXGroup; children = (); sourceTree = "<group>"; };
		10CA1PR000000000000000AA = {isa = PBXProject; buildConfigurationList = 10CA1C1000000000000000AA; mainGroup = 10CA16R000000000000000AA; targets = (); };
		10CA1C1000000000000000AA = {isa = XCConfigurationList; buildConfigurations = (10CA1CF000000000000000AA); defaultConfigurationName = Debug; };
		10CA1CF000000000000000AA = {isa = XCBuildConfiguration; buildSettings = {}; name = Debug; };
	};
	rootObject = 10CA1PR000000000000000AA;
}
"#;

/// Write the fixture project plus its referenced files under `root`.
/// Returns the `.xcodeproj` directory.
pub fn write_fixture_project(root: &Path) -> PathBuf {
    let xcodeproj = root.join("Fixture.xcodeproj");
    fs::create_dir_all(&xcodeproj).expect("create xcodeproj dir");
    fs::write(xcodeproj.join("project.pbxproj"), FIXTURE_PBXPROJ).expect("write pbxproj");
    write_fixture_files(root);
    xcodeproj
}

/// A pods-style checkout: `{root}/Pods/Pods.xcodeproj` with the fixture
/// targets, source files, xcconfig, the referenced `Local` sub-project and
/// a workspace `Podfile.lock`. Returns the root project directory.
pub fn write_pods_workspace(root: &Path) -> PathBuf {
    let pods = root.join("Pods");
    let xcodeproj = pods.join("Pods.xcodeproj");
    fs::create_dir_all(&xcodeproj).expect("create xcodeproj dir");
    fs::write(xcodeproj.join("project.pbxproj"), FIXTURE_PBXPROJ).expect("write pbxproj");
    write_fixture_files(&pods);

    let local = pods.join("Local/Local.xcodeproj");
    fs::create_dir_all(&local).expect("create local project");
    fs::write(local.join("project.pbxproj"), LOCAL_PBXPROJ).expect("write local pbxproj");

    fs::write(
        root.join("Podfile.lock"),
        "PODS:\n  - Alamofire (5.8.0)\n\nSPEC CHECKSUMS:\n  Alamofire: 0123abcd0123abcd0123abcd0123abcd0123abcd\n\nCOCOAPODS: 1.14.2\n",
    )
    .expect("write Podfile.lock");

    xcodeproj
}

fn write_fixture_files(source_root: &Path) {
    let source_dir = source_root.join("Alamofire/Source");
    fs::create_dir_all(source_dir.join("Resources")).expect("create source tree");
    fs::write(source_dir.join("AF.swift"), "public enum AF {}\n").expect("write source");
    fs::write(source_dir.join("HTTP.swift"), "public struct HTTPClient {}\n")
        .expect("write source");
    fs::write(source_dir.join("Resources/logo.txt"), "logo-bytes\n").expect("write resource");

    fs::write(
        source_root.join("Alamofire.debug.xcconfig"),
        "SWIFT_VERSION = 5.9\nFRAMEWORK_SEARCH_PATHS = $(inherited) /tmp/frameworks\nOTHER_SWIFT_FLAGS = -DRELEASE_LOGGING\n",
    )
    .expect("write xcconfig");
}
