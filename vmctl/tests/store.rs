//! End-to-end store scenarios: primary disk, export, import, port reuse.

#![allow(clippy::unwrap_used)]

use std::fs;
use std::path::Path;

use flate2::read::GzDecoder;
use vmctl::{DiskFormat, Error, Graphics, Hypervisor, ImageTool, Runtime, StoreLayout};

fn runtime(home: &Path) -> Runtime {
    Runtime::open(StoreLayout::new(home))
        .unwrap()
        .with_image_tool(ImageTool::Disabled)
}

fn entries(bundle: &Path) -> Vec<String> {
    let mut archive = tar::Archive::new(GzDecoder::new(fs::File::open(bundle).unwrap()));
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().display().to_string())
        .collect()
}

#[test]
fn new_vm_gets_one_primary_disk_of_configured_size() {
    let tmp = tempfile::tempdir().unwrap();
    let rt = runtime(tmp.path());
    let mut vm = rt.create("web01").unwrap();
    assert!(vm.config().disks.is_empty());

    vm.ensure_primary_disk().unwrap();
    vm.ensure_primary_disk().unwrap();

    let disks = &vm.config().disks;
    assert_eq!(disks.len(), 1);
    assert!(disks[0].path.ends_with("web01/disks/web01-disk0.raw"));
    assert_eq!(disks[0].format, DiskFormat::Raw);
    assert_eq!(fs::metadata(&disks[0].path).unwrap().len(), 32 << 30);
    assert_eq!(rt.get("web01").unwrap().config().disks, *disks);
}

#[test]
fn export_then_import_round_trips() {
    let tmp = tempfile::tempdir().unwrap();
    let src = runtime(&tmp.path().join("src"));
    let mut vm = src.create("web01").unwrap();
    vm.create_disk("a.raw", 0, DiskFormat::Raw).unwrap();
    vm.create_disk("b.raw", 0, DiskFormat::Raw).unwrap();
    fs::write(&vm.config().disks[1].path, b"payload").unwrap();
    let iso = tmp.path().join("install.iso");
    fs::write(&iso, b"iso").unwrap();
    vm.attach_iso(&iso).unwrap();

    let bundle = src.export("web01", None, false).unwrap();
    assert_eq!(bundle, src.layout().exports_dir().join("web01.tar.gz"));
    assert_eq!(
        entries(&bundle),
        ["web01/config.json", "web01/disks/a.raw", "web01/disks/b.raw"]
    );

    let dst = runtime(&tmp.path().join("dst"));
    let imported = dst.import(&bundle).unwrap();
    assert_eq!(imported.name(), "web01");
    assert_eq!(
        fs::read(dst.layout().config_path("web01")).unwrap(),
        fs::read(src.layout().config_path("web01")).unwrap()
    );
    assert_eq!(
        fs::read(dst.layout().disks_dir("web01").join("b.raw")).unwrap(),
        b"payload"
    );

    assert!(matches!(dst.import(&bundle), Err(Error::AlreadyExists(_))));
}

#[test]
fn imported_disks_launch_from_local_copies() {
    let tmp = tempfile::tempdir().unwrap();
    let qemu = tmp.path().join("qemu-system-x86_64");
    fs::write(&qemu, b"").unwrap();

    let src = runtime(&tmp.path().join("src"));
    let mut vm = src.create("vm").unwrap();
    vm.create_disk("d.raw", 0, DiskFormat::Raw).unwrap();
    let bundle = src.export("vm", Some(&tmp.path().join("vm.tar.gz")), false).unwrap();
    src.remove("vm").unwrap();

    let dst = runtime(&tmp.path().join("dst")).with_hypervisor(Hypervisor::Path(qemu));
    let mut vm = dst.import(&bundle).unwrap();
    let cmd = vm.command(None).unwrap();
    let local = std::path::absolute(dst.layout().disks_dir("vm").join("d.raw")).unwrap();
    let drive = format!("file={},format=raw,if=virtio", local.display());
    assert!(cmd.args.contains(&drive), "{:?}", cmd.args);
    assert_eq!(vm.config().disks.len(), 1);
}

#[test]
fn imported_disks_avoid_a_live_source_image() {
    let tmp = tempfile::tempdir().unwrap();
    let qemu = tmp.path().join("qemu-system-x86_64");
    fs::write(&qemu, b"").unwrap();

    let src = runtime(&tmp.path().join("src"));
    let mut vm = src.create("vm").unwrap();
    let source = vm.create_disk("d.raw", 0, DiskFormat::Raw).unwrap();
    let bundle = src.export("vm", Some(&tmp.path().join("vm.tar.gz")), false).unwrap();

    let dst = runtime(&tmp.path().join("dst")).with_hypervisor(Hypervisor::Path(qemu));
    let mut vm = dst.import(&bundle).unwrap();
    assert!(source.path.is_file());
    assert_eq!(vm.config().disks[0].path, source.path);

    let cmd = vm.command(None).unwrap();
    let local = std::path::absolute(dst.layout().disks_dir("vm").join("d.raw")).unwrap();
    let drive = format!("file={},format=raw,if=virtio", local.display());
    assert!(cmd.args.contains(&drive), "{:?}", cmd.args);
    assert!(
        !cmd.args.iter().any(|a| a.contains(&*source.path.to_string_lossy())),
        "{:?}",
        cmd.args
    );
}

#[test]
fn imported_iso_launches_from_local_copy() {
    let tmp = tempfile::tempdir().unwrap();
    let qemu = tmp.path().join("qemu-system-x86_64");
    fs::write(&qemu, b"").unwrap();
    let iso = tmp.path().join("install.iso");
    fs::write(&iso, b"iso").unwrap();

    let src = runtime(&tmp.path().join("src"));
    let mut vm = src.create("vm").unwrap();
    vm.create_disk("d.raw", 0, DiskFormat::Raw).unwrap();
    vm.attach_iso(&iso).unwrap();
    let bundle = src.export("vm", Some(&tmp.path().join("vm.tar.gz")), true).unwrap();
    assert!(entries(&bundle).contains(&"vm/iso/install.iso".to_owned()));
    fs::remove_file(&iso).unwrap();

    let dst = runtime(&tmp.path().join("dst")).with_hypervisor(Hypervisor::Path(qemu));
    let mut vm = dst.import(&bundle).unwrap();
    let cmd = vm.command(None).unwrap();
    let local = std::path::absolute(dst.layout().iso_dir("vm").join("install.iso")).unwrap();
    let at = cmd.args.iter().position(|a| a == "-cdrom").unwrap();
    assert_eq!(cmd.args[at + 1], local.to_string_lossy());
    assert_eq!(fs::read(&local).unwrap(), b"iso");
}

#[test]
fn vnc_port_is_reused_across_builds() {
    let tmp = tempfile::tempdir().unwrap();
    let qemu = tmp.path().join("qemu-system-x86_64");
    fs::write(&qemu, b"").unwrap();
    let rt = runtime(&tmp.path().join("home")).with_hypervisor(Hypervisor::Path(qemu));

    let mut vm = rt.create("vm").unwrap();
    vm.config_mut().graphics = Graphics::Vnc;
    vm.config_mut().disk_gib = 0;
    vm.save().unwrap();

    let first = vm.command(None).unwrap();
    let port = vm.config().advanced.vnc_port.unwrap();
    let second = rt.get("vm").unwrap().command(None).unwrap();
    assert_eq!(first.args, second.args);
    assert_eq!(rt.get("vm").unwrap().config().advanced.vnc_port, Some(port));
}

#[test]
fn corrupt_vm_is_skipped_by_list() {
    let tmp = tempfile::tempdir().unwrap();
    let rt = runtime(tmp.path());
    rt.create("good").unwrap();
    rt.create("bad").unwrap();
    fs::write(rt.layout().config_path("bad"), b"{\"cpu_cores\": [").unwrap();

    let names: Vec<_> = rt.list().unwrap().into_iter().map(|c| c.name).collect();
    assert_eq!(names, ["good"]);
    assert!(matches!(rt.get("bad"), Err(Error::ConfigCorrupt { .. })));
}
