use minixfs::io::ImageFileBuilder;
use minixfs::{FormatOptions, MinixFs, Version};

pub fn main() {
    let tmp = tempfile::tempfile().unwrap();
    let dev = ImageFileBuilder::from(tmp)
        .with_block_count(256)
        .build()
        .expect("Could not size the scratch image.");

    // format a V2 image, then write a file one level below the root
    let options = FormatOptions {
        version: Version::V2,
        ..FormatOptions::default()
    };
    let mut fs = MinixFs::format(dev, &options).expect("should format");
    fs.mkdir("etc").unwrap();
    fs.touch("etc/motd").unwrap();
    fs.append("etc/motd", b"welcome to minix\n").unwrap();

    for entry in fs.ls(Some("etc")).unwrap() {
        println!("{:>5} {}", entry.inode, entry.name_lossy());
    }
    print!("{}", String::from_utf8_lossy(&fs.cat("etc/motd").unwrap()));
}
