//! Image loading.
//!
//! An image is a gzip stream of 32-bit words in either byte order. After a
//! short header comes the object memory as a sequence of records. Each record
//! is registered immediately with its raw words and the address it had when
//! the image was saved; a second pass resolves classes and decodes the words
//! into their final body once every address is known.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use log::{debug, info};

use crate::{
    Body, HeapObject, ImageError, ObjectMemory, Value, VmConfig,
    object::{is_byte_format, is_method_format, is_pointer_format},
    special::{CLASS_FLOAT, COMPACT_CLASSES},
};

pub const IMAGE_MAGIC: u32 = 6502;
/// Magic plus the eight header fields.
pub const HEADER_PREFIX_BYTES: u32 = 36;

const HEADER_TYPE_SIZE_AND_CLASS: u32 = 0;
const HEADER_TYPE_CLASS: u32 = 1;
const HEADER_TYPE_FREE_BLOCK: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageHeader {
    pub header_size: u32,
    pub end_of_memory: u32,
    pub old_base_address: u32,
    pub special_objects_oop: u32,
    pub last_hash: u32,
    pub saved_window_size: u32,
    pub full_screen: u32,
    pub extra_vm_memory: u32,
}

impl ImageHeader {
    /// Saved window extent as (width, height).
    pub fn window_extent(&self) -> (u32, u32) {
        (self.saved_window_size >> 16, self.saved_window_size & 0xFFFF)
    }
}

pub struct LoadedImage {
    pub memory: ObjectMemory,
    pub header: ImageHeader,
    pub byte_order: ByteOrder,
    pub special_objects: Value,
}

struct WordReader<R> {
    inner: R,
    order: ByteOrder,
}

impl<R: Read> WordReader<R> {
    fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(match self.order {
            ByteOrder::Big => u32::from_be_bytes(buf),
            ByteOrder::Little => u32::from_le_bytes(buf),
        })
    }

    fn skip(&mut self, bytes: u64) -> io::Result<()> {
        let copied = io::copy(&mut (&mut self.inner).take(bytes), &mut io::sink())?;
        if copied < bytes {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "image header truncated",
            ));
        }
        Ok(())
    }
}

enum RawClass {
    Compact(u32),
    Oop(u32),
}

struct RawObject {
    value: Value,
    oop: u32,
    class: RawClass,
    format: u8,
    words: Vec<u32>,
}

pub fn load_image(path: &Path, config: &VmConfig) -> Result<LoadedImage, ImageError> {
    info!("loading image {}", path.display());
    let file = File::open(path)?;
    read_image(BufReader::new(file), config)
}

/// Reads a gzip-compressed image.
pub fn read_image<R: Read>(reader: R, config: &VmConfig) -> Result<LoadedImage, ImageError> {
    read_raw_image(GzDecoder::new(reader), config)
}

/// Reads an already decompressed image stream.
pub fn read_raw_image<R: Read>(
    mut reader: R,
    config: &VmConfig,
) -> Result<LoadedImage, ImageError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    let order = if u32::from_be_bytes(magic) == IMAGE_MAGIC {
        ByteOrder::Big
    } else if u32::from_le_bytes(magic) == IMAGE_MAGIC {
        ByteOrder::Little
    } else {
        return Err(ImageError::BadMagic(u32::from_be_bytes(magic)));
    };
    let mut words = WordReader {
        inner: reader,
        order,
    };

    let header = ImageHeader {
        header_size: words.read_u32()?,
        end_of_memory: words.read_u32()?,
        old_base_address: words.read_u32()?,
        special_objects_oop: words.read_u32()?,
        last_hash: words.read_u32()?,
        saved_window_size: words.read_u32()?,
        full_screen: words.read_u32()?,
        extra_vm_memory: words.read_u32()?,
    };
    info!(
        "image header: {:?} order, {} bytes of objects, old base {:#x}",
        order, header.end_of_memory, header.old_base_address
    );
    words.skip(u64::from(header.header_size.saturating_sub(HEADER_PREFIX_BYTES)))?;

    let mut memory = ObjectMemory::new(config);
    memory.seed_hash(header.last_hash);
    let (objects, oop_map) = read_objects(&mut words, &header, &mut memory)?;
    debug!("read {} object records", objects.len());

    install(&objects, &oop_map, &header, order, &mut memory)?;
    memory.tenure();

    let special_objects = objects[lookup_record(&oop_map, header.special_objects_oop)
        .ok_or(ImageError::MissingObject("special objects array"))?]
    .value;
    info!("image loaded: {} objects", memory.len());
    Ok(LoadedImage {
        memory,
        header,
        byte_order: order,
        special_objects,
    })
}

fn lookup_record(oop_map: &HashMap<u32, usize>, oop: u32) -> Option<usize> {
    oop_map.get(&oop).copied()
}

fn read_objects<R: Read>(
    words: &mut WordReader<R>,
    header: &ImageHeader,
    memory: &mut ObjectMemory,
) -> Result<(Vec<RawObject>, HashMap<u32, usize>), ImageError> {
    let mut objects = Vec::new();
    let mut oop_map = HashMap::new();
    let mut position: u32 = 0;

    while position < header.end_of_memory {
        let first = words.read_u32()?;
        let (class, base_header, count) = match first & 3 {
            HEADER_TYPE_SIZE_AND_CLASS => {
                let class = words.read_u32()?;
                let base = words.read_u32()?;
                position = advance(position, 12, header)?;
                (RawClass::Oop(class), base, first >> 2)
            }
            HEADER_TYPE_CLASS => {
                let base = words.read_u32()?;
                position = advance(position, 8, header)?;
                (RawClass::Oop(first - HEADER_TYPE_CLASS), base, (base >> 2) & 63)
            }
            HEADER_TYPE_FREE_BLOCK => {
                return Err(ImageError::FreeBlock { offset: position });
            }
            // short header, class given as a compact class index
            _ => {
                position = advance(position, 4, header)?;
                (RawClass::Compact((first >> 12) & 31), first, (first >> 2) & 63)
            }
        };

        let base_offset = position - 4;
        let count = count.saturating_sub(1);
        let format = ((base_header >> 8) & 15) as u8;
        let hash = ((base_header >> 17) & 4095) as u16;
        let end = count
            .checked_mul(4)
            .and_then(|bytes| position.checked_add(bytes))
            .filter(|end| *end <= header.end_of_memory)
            .ok_or(ImageError::ObjectOverrun {
                offset: base_offset,
                words: count,
            })?;
        let mut body = Vec::with_capacity(count as usize);
        for _ in 0..count {
            body.push(words.read_u32()?);
        }
        position = end;

        let mut object = HeapObject::new(Value::from_raw(1), format, Body::Words(Vec::new()));
        object.hash = hash;
        let value = memory.register_image_object(object)?;
        let oop = header.old_base_address.wrapping_add(base_offset);
        oop_map.insert(oop, objects.len());
        objects.push(RawObject {
            value,
            oop,
            class,
            format,
            words: body,
        });
    }
    Ok((objects, oop_map))
}

/// Moves past an object header, which must still lie inside object memory.
fn advance(position: u32, bytes: u32, header: &ImageHeader) -> Result<u32, ImageError> {
    position
        .checked_add(bytes)
        .filter(|end| *end <= header.end_of_memory)
        .ok_or(ImageError::ObjectOverrun {
            offset: position,
            words: 0,
        })
}

fn install(
    objects: &[RawObject],
    oop_map: &HashMap<u32, usize>,
    header: &ImageHeader,
    order: ByteOrder,
    memory: &mut ObjectMemory,
) -> Result<(), ImageError> {
    let specials = lookup_record(oop_map, header.special_objects_oop)
        .map(|index| &objects[index])
        .ok_or(ImageError::MissingObject("special objects array"))?;
    let compact_classes = specials
        .words
        .get(COMPACT_CLASSES)
        .and_then(|oop| lookup_record(oop_map, *oop))
        .map(|index| &objects[index].words)
        .ok_or(ImageError::MissingObject("compact classes array"))?;
    let float_class = specials.words.get(CLASS_FLOAT).copied();

    let resolve = |word: u32, from: u32| -> Result<Value, ImageError> {
        if word & 1 == 1 {
            return Ok(Value::from_raw(word));
        }
        lookup_record(oop_map, word)
            .map(|index| objects[index].value)
            .ok_or(ImageError::UnknownOop {
                oop: word,
                offset: from,
            })
    };
    let decode = |words: &[u32], from: u32| -> Result<Vec<Value>, ImageError> {
        words.iter().map(|w| resolve(*w, from)).collect()
    };

    for raw in objects {
        let class_oop = match raw.class {
            RawClass::Oop(oop) => oop,
            RawClass::Compact(index) => *compact_classes
                .get((index as usize).wrapping_sub(1))
                .ok_or(ImageError::MissingObject("compact class"))?,
        };
        let class = resolve(class_oop, raw.oop)?;

        let format = raw.format;
        let body = if is_pointer_format(format) {
            Body::Pointers(decode(&raw.words, raw.oop)?)
        } else if is_method_format(format) {
            let header_word = raw.words.first().copied().unwrap_or(1);
            let literal_count = ((header_word >> 10) & 255) as usize + 1;
            let split = literal_count.min(raw.words.len());
            let literals = decode(&raw.words[..split], raw.oop)?;
            let bytecode = unpack_bytes(&raw.words[split..], format, order);
            Body::Method { literals, bytecode }
        } else if is_byte_format(format) {
            Body::Bytes(unpack_bytes(&raw.words, format, order))
        } else if Some(class_oop) == float_class && raw.words.len() == 2 {
            let bits = (u64::from(raw.words[0]) << 32) | u64::from(raw.words[1]);
            Body::Float(f64::from_bits(bits))
        } else {
            Body::Words(raw.words.clone())
        };

        let object = memory.object_mut(raw.value)?;
        object.class = class;
        object.body = body;
    }
    Ok(())
}

fn unpack_bytes(words: &[u32], format: u8, order: ByteOrder) -> Vec<u8> {
    let mut bytes: Vec<u8> = words
        .iter()
        .flat_map(|w| match order {
            ByteOrder::Big => w.to_be_bytes(),
            ByteOrder::Little => w.to_le_bytes(),
        })
        .collect();
    let unused = usize::from(format & 3);
    bytes.truncate(bytes.len().saturating_sub(unused));
    bytes
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{Compression, write::GzEncoder};

    use super::*;
    use crate::object::{ClassFormat, MethodHeader};

    const OLD_BASE: u32 = 0x0010_0000;

    enum Word {
        Raw(u32),
        Ref(usize),
        Small(i32),
    }

    enum Kind {
        Short(u32),
        Class(usize),
        Sized(usize),
    }

    struct Record {
        kind: Kind,
        format: u32,
        hash: u32,
        body: Vec<Word>,
    }

    fn header_words(kind: &Kind) -> u32 {
        match kind {
            Kind::Short(_) => 1,
            Kind::Class(_) => 2,
            Kind::Sized(_) => 3,
        }
    }

    /// Lays the records out and returns the object memory words plus the oop of each record.
    fn layout(records: &[Record]) -> (Vec<u32>, Vec<u32>) {
        let mut oops = Vec::new();
        let mut offset = 0;
        for record in records {
            let extra = header_words(&record.kind);
            oops.push(OLD_BASE + offset + (extra - 1) * 4);
            offset += (extra + record.body.len() as u32) * 4;
        }

        let mut out = Vec::new();
        for record in records {
            let size = record.body.len() as u32 + 1;
            let base = (record.format << 8) | (record.hash << 17);
            match record.kind {
                Kind::Short(compact) => out.push(base | (size << 2) | (compact << 12) | 3),
                Kind::Class(class) => {
                    out.push(oops[class] | 1);
                    out.push(base | (size << 2) | 1);
                }
                Kind::Sized(class) => {
                    out.push(size << 2);
                    out.push(oops[class]);
                    out.push(base);
                }
            }
            for word in &record.body {
                out.push(match word {
                    Word::Raw(raw) => *raw,
                    Word::Ref(index) => oops[*index],
                    Word::Small(n) => ((*n as u32) << 1) | 1,
                });
            }
        }
        (out, oops)
    }

    fn byte_words(bytes: &[u8], order: ByteOrder) -> Vec<Word> {
        bytes
            .chunks(4)
            .map(|chunk| {
                let mut buf = [0u8; 4];
                buf[..chunk.len()].copy_from_slice(chunk);
                Word::Raw(match order {
                    ByteOrder::Big => u32::from_be_bytes(buf),
                    ByteOrder::Little => u32::from_le_bytes(buf),
                })
            })
            .collect()
    }

    fn sample_records(order: ByteOrder) -> Vec<Record> {
        let class_format = ClassFormat::new(0, 1).0;
        let method_header = MethodHeader::new(0, 0, 1, 0, false).0;
        let float_bits = 2.5f64.to_bits();
        let mut specials: Vec<Word> = (0..31).map(|_| Word::Ref(0)).collect();
        specials[CLASS_FLOAT] = Word::Ref(2);
        specials[COMPACT_CLASSES] = Word::Ref(3);
        let mut compact: Vec<Word> = (0..31).map(|_| Word::Ref(0)).collect();
        compact[0] = Word::Ref(1);

        vec![
            // 0: nil
            Record {
                kind: Kind::Class(1),
                format: 0,
                hash: 1,
                body: vec![],
            },
            // 1: a class that is its own class
            Record {
                kind: Kind::Class(1),
                format: 1,
                hash: 2,
                body: vec![Word::Ref(0), Word::Ref(0), Word::Small(class_format)],
            },
            // 2: the float class
            Record {
                kind: Kind::Class(1),
                format: 1,
                hash: 3,
                body: vec![Word::Ref(0), Word::Ref(0), Word::Small(class_format)],
            },
            // 3: compact classes
            Record {
                kind: Kind::Class(1),
                format: 2,
                hash: 4,
                body: compact,
            },
            // 4: special objects
            Record {
                kind: Kind::Class(1),
                format: 2,
                hash: 5,
                body: specials,
            },
            // 5: words, class through compact index 1
            Record {
                kind: Kind::Short(1),
                format: 6,
                hash: 6,
                body: vec![Word::Raw(0xDEAD_BEEF), Word::Raw(7)],
            },
            // 6: "hello", three unused bytes
            Record {
                kind: Kind::Sized(1),
                format: 11,
                hash: 7,
                body: byte_words(b"hello", order),
            },
            // 7: method with one literal and bytecodes 0x70 0x7C
            Record {
                kind: Kind::Class(1),
                format: 14,
                hash: 8,
                body: {
                    let mut body = vec![Word::Small(method_header), Word::Ref(0)];
                    body.extend(byte_words(&[0x70, 0x7C], order));
                    body
                },
            },
            // 8: a float
            Record {
                kind: Kind::Class(2),
                format: 6,
                hash: 9,
                body: vec![Word::Raw((float_bits >> 32) as u32), Word::Raw(float_bits as u32)],
            },
            // 9: pointers to the others
            Record {
                kind: Kind::Class(1),
                format: 2,
                hash: 10,
                body: vec![Word::Small(-3), Word::Ref(5), Word::Ref(8)],
            },
        ]
    }

    fn image_bytes(records: &[Record], order: ByteOrder) -> Vec<u8> {
        let (body, oops) = layout(records);
        let header_size = 64u32;
        let mut words = vec![
            IMAGE_MAGIC,
            header_size,
            body.len() as u32 * 4,
            OLD_BASE,
            oops.get(4).copied().unwrap_or(0),
            0x1234,
            (640 << 16) | 480,
            0,
            0,
        ];
        words.resize((header_size / 4) as usize, 0);
        words.extend(body);
        words
            .iter()
            .flat_map(|w| match order {
                ByteOrder::Big => w.to_be_bytes(),
                ByteOrder::Little => w.to_le_bytes(),
            })
            .collect()
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).expect("compress");
        encoder.finish().expect("finish gzip")
    }

    fn temp_image_path() -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock before unix epoch")
            .as_nanos();
        path.push(format!("bluebook-image-test-{}-{nanos}.image", std::process::id()));
        path
    }

    fn load(order: ByteOrder) -> LoadedImage {
        let bytes = gzip(&image_bytes(&sample_records(order), order));
        read_image(bytes.as_slice(), &VmConfig::compact()).expect("image loads")
    }

    fn nth(image: &mut LoadedImage, n: usize) -> Value {
        image.memory.next_instance(n, None).expect("object exists")
    }

    fn check_sample(mut image: LoadedImage) {
        assert_eq!(image.memory.len(), 10);
        assert_eq!(image.memory.max_old(), 10);
        assert_eq!(image.header.window_extent(), (640, 480));
        let nil = nth(&mut image, 0);
        let class = nth(&mut image, 1);
        let float_class = nth(&mut image, 2);
        let words = nth(&mut image, 5);
        let bytes = nth(&mut image, 6);
        let method = nth(&mut image, 7);
        let float = nth(&mut image, 8);
        let holder = nth(&mut image, 9);
        let specials = nth(&mut image, 4);
        let memory = &image.memory;

        assert_eq!(image.special_objects, specials);
        assert_eq!(memory.fetch(image.special_objects, CLASS_FLOAT), Ok(float_class));

        let object = memory.object(nil).expect("nil");
        assert_eq!(object.class, class);
        assert_eq!(object.pointer_len(), 0);

        let object = memory.object(words).expect("words");
        assert_eq!(object.class, class);
        assert_eq!(object.words(), Some(&[0xDEAD_BEEF, 7][..]));
        assert_eq!(object.hash, 6);

        let object = memory.object(bytes).expect("bytes");
        assert_eq!(object.bytes(), Some(&b"hello"[..]));

        let object = memory.object(method).expect("method");
        let literals = object.pointers().expect("literals");
        assert_eq!(literals.len(), 2);
        assert_eq!(literals[1], nil);
        assert_eq!(object.method_header().map(|h| h.num_literals()), Some(1));
        assert_eq!(object.bytes(), Some(&[0x70, 0x7C][..]));

        let object = memory.object(float).expect("float");
        assert_eq!(object.class, float_class);
        assert_eq!(object.float(), Some(2.5));

        assert_eq!(
            memory.object(holder).expect("holder").pointers(),
            Some(&[Value::small(-3).expect("small"), words, float][..])
        );
    }

    #[test]
    fn loads_big_endian_image() {
        check_sample(load(ByteOrder::Big));
    }

    #[test]
    fn loads_little_endian_image() {
        let image = load(ByteOrder::Little);
        assert_eq!(image.byte_order, ByteOrder::Little);
        check_sample(image);
    }

    #[test]
    fn loads_from_file() {
        let path = temp_image_path();
        let bytes = gzip(&image_bytes(&sample_records(ByteOrder::Big), ByteOrder::Big));
        std::fs::write(&path, bytes).expect("write image");
        let image = load_image(&path, &VmConfig::compact());
        let _ = std::fs::remove_file(&path);
        check_sample(image.expect("image loads"));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = image_bytes(&sample_records(ByteOrder::Big), ByteOrder::Big);
        bytes[3] ^= 0xFF;
        let result = read_image(gzip(&bytes).as_slice(), &VmConfig::compact());
        assert!(matches!(result, Err(ImageError::BadMagic(_))));
    }

    #[test]
    fn rejects_free_block() {
        let mut bytes = image_bytes(&sample_records(ByteOrder::Big), ByteOrder::Big);
        // first record's class word gets the free block type
        bytes[64 + 3] = (bytes[64 + 3] & !3) | 2;
        let result = read_image(gzip(&bytes).as_slice(), &VmConfig::compact());
        assert!(matches!(result, Err(ImageError::FreeBlock { offset: 0 })));
    }

    #[test]
    fn rejects_object_larger_than_memory() {
        let mut records = sample_records(ByteOrder::Big);
        records[0].kind = Kind::Sized(1);
        let mut bytes = image_bytes(&records, ByteOrder::Big);
        // size word claiming 0x3FFF_FFFF words
        bytes[64..68].copy_from_slice(&0xFFFF_FFFCu32.to_be_bytes());
        let result = read_image(gzip(&bytes).as_slice(), &VmConfig::compact());
        assert!(matches!(
            result,
            Err(ImageError::ObjectOverrun { offset: 8, words: 0x3FFF_FFFE })
        ));
    }

    #[test]
    fn rejects_body_running_past_end_of_memory() {
        let records = sample_records(ByteOrder::Big);
        let mut bytes = image_bytes(&records, ByteOrder::Big);
        // end of memory cut one word short of the last record
        let end = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) - 4;
        bytes[8..12].copy_from_slice(&end.to_be_bytes());
        let result = read_image(gzip(&bytes).as_slice(), &VmConfig::compact());
        assert!(matches!(result, Err(ImageError::ObjectOverrun { words: 3, .. })));
    }

    #[test]
    fn rejects_dangling_reference() {
        let mut records = sample_records(ByteOrder::Big);
        records[9].body.push(Word::Raw(OLD_BASE + 0x7FF0));
        let bytes = gzip(&image_bytes(&records, ByteOrder::Big));
        let result = read_image(bytes.as_slice(), &VmConfig::compact());
        assert!(matches!(
            result,
            Err(ImageError::UnknownOop { oop, .. }) if oop == OLD_BASE + 0x7FF0
        ));
    }
}
